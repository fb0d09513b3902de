//! Test-Doubles: Signal-Sink, Media-Sessions und ein simulierter Relay

use crate::call_engine::{
    CallCoordinator, CallEvent, LocalIdentity, MediaConstraints,
};
use crate::config::CallConfig;
use crate::peer::{
    LinkId, LocalTracks, MediaSession, PeerError, SessionEvent, SessionFactory, SessionNotifier,
    TransportState,
};
use crate::signaling::{Candidate, ParticipantInfo, SignalMessage, SignalSink};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

pub fn identity(id: &str, elevated: bool) -> LocalIdentity {
    LocalIdentity::new(id.to_string(), id.to_uppercase(), elevated)
}

pub fn test_config() -> CallConfig {
    CallConfig {
        capture: MediaConstraints::none(),
        ..CallConfig::default()
    }
}

// ============================================================================
// SIGNAL SINK
// ============================================================================

/// Zeichnet gesendete Nachrichten auf; offline wird alles verworfen
pub struct RecordingSink {
    online: AtomicBool,
    sent: Mutex<Vec<SignalMessage>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Entnimmt alle bisher gesendeten Nachrichten
    pub fn take(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().clone()
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, message: SignalMessage) -> bool {
        if !self.online.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().push(message);
        true
    }
}

// ============================================================================
// MEDIA SESSION
// ============================================================================

#[derive(Debug, Default)]
struct FakeState {
    offers: u32,
    answers: u32,
    local_description: Option<String>,
    remote_description: Option<String>,
    remote_candidates: Vec<Candidate>,
    closed: bool,
}

/// Session ohne Netzwerk; meldet nach jeder Local Description einen Candidate
pub struct FakeSession {
    pub remote: String,
    notifier: SessionNotifier,
    state: Mutex<FakeState>,
}

impl FakeSession {
    pub fn link(&self) -> LinkId {
        self.notifier.link()
    }

    pub fn offers(&self) -> u32 {
        self.state.lock().offers
    }

    pub fn answers(&self) -> u32 {
        self.state.lock().answers
    }

    pub fn remote_description(&self) -> Option<String> {
        self.state.lock().remote_description.clone()
    }

    pub fn remote_candidates(&self) -> Vec<Candidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Beide Descriptions gesetzt und nicht geschlossen
    pub fn is_negotiated(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.local_description.is_some() && state.remote_description.is_some()
    }

    pub fn notify_transport(&self, state: TransportState) {
        self.notifier.transport(state);
    }

    pub fn notify_candidate(&self, candidate: Candidate) {
        self.notifier.local_candidate(candidate);
    }

    fn local_description(&self, kind: &str) -> Result<String, PeerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::WebRtc("session closed".to_string()));
        }
        let sdp = format!("v=0 {} {}", kind, self.notifier.link());
        state.local_description = Some(sdp.clone());
        drop(state);

        self.notifier.local_candidate(Candidate {
            candidate: format!("candidate:{} 1 udp 2122260223 127.0.0.1 5000 typ host", self.link().0),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        Ok(sdp)
    }

    fn set_remote(&self, sdp: &str) -> Result<(), PeerError> {
        if sdp == "garbage" {
            return Err(PeerError::InvalidSdp("unparseable".to_string()));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::WebRtc("session closed".to_string()));
        }
        state.remote_description = Some(sdp.to_string());
        Ok(())
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn create_offer(&self) -> Result<String, PeerError> {
        self.state.lock().offers += 1;
        self.local_description("offer")
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        self.state.lock().answers += 1;
        self.local_description("answer")
    }

    async fn apply_remote_offer(&self, sdp: &str) -> Result<(), PeerError> {
        self.set_remote(sdp)
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<(), PeerError> {
        self.set_remote(sdp)
    }

    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.remote_description.is_none() {
            return Err(PeerError::WebRtc("remote description not set".to_string()));
        }
        state.remote_candidates.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Erzeugt [`FakeSession`]s und merkt sie sich
pub struct FakeFactory {
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Alle Sessions zu `remote`, älteste zuerst
    pub fn sessions_for(&self, remote: &str) -> Vec<Arc<FakeSession>> {
        self.sessions
            .lock()
            .iter()
            .filter(|s| s.remote == remote)
            .cloned()
            .collect()
    }

    /// Jüngste Session zu `remote`
    pub fn session_for(&self, remote: &str) -> Option<Arc<FakeSession>> {
        self.sessions_for(remote).pop()
    }

    pub fn open_count(&self, remote: &str) -> usize {
        self.sessions_for(remote).len()
    }

    pub fn all(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().clone()
    }
}

#[async_trait]
impl SessionFactory for FakeFactory {
    async fn create_session(
        &self,
        notifier: SessionNotifier,
        _tracks: &LocalTracks,
    ) -> Result<Arc<dyn MediaSession>, PeerError> {
        let session = Arc::new(FakeSession {
            remote: notifier.remote().to_string(),
            notifier,
            state: Mutex::new(FakeState::default()),
        });
        self.sessions.lock().push(Arc::clone(&session));
        Ok(session)
    }
}

// ============================================================================
// MESH HARNESS
// ============================================================================

/// Ein Client im simulierten Raum
pub struct Node {
    pub coordinator: CallCoordinator,
    pub sink: Arc<RecordingSink>,
    pub factory: Arc<FakeFactory>,
    pub events: broadcast::Receiver<CallEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Node {
    pub fn new(id: &str, elevated: bool) -> Self {
        Self::with_config(id, elevated, test_config())
    }

    pub fn with_config(id: &str, elevated: bool, config: CallConfig) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let factory = Arc::new(FakeFactory::new());
        let (event_tx, events) = broadcast::channel(1024);
        let (coordinator, session_rx) = CallCoordinator::new(
            identity(id, elevated),
            config,
            factory.clone(),
            sink.clone(),
            event_tx,
        );
        Self {
            coordinator,
            sink,
            factory,
            events,
            session_rx,
        }
    }

    pub fn id(&self) -> String {
        self.coordinator.identity().participant_id.clone()
    }

    /// Alle bisher aufgelaufenen Events
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Session-Callbacks in den Coordinator leiten; `true` wenn etwas kam
    pub async fn pump_sessions(&mut self) -> bool {
        let mut any = false;
        while let Ok(event) = self.session_rx.try_recv() {
            self.coordinator.handle_session_event(event).await;
            any = true;
        }
        any
    }
}

/// Simulierter Relay mit mehreren Clients
///
/// Broadcasts gehen an alle anderen Verbundenen, gezielte Nachrichten nur an
/// das Ziel, `roster-request` wird mit dem Raumzustand beantwortet.
pub struct Mesh {
    pub nodes: Vec<Node>,
    call_id: Option<String>,
    members: BTreeMap<String, ParticipantInfo>,
    offline: HashSet<String>,
}

impl Mesh {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            call_id: None,
            members: BTreeMap::new(),
            offline: HashSet::new(),
        }
    }

    pub fn node(&mut self, id: &str) -> &mut Node {
        let idx = self.index(id);
        &mut self.nodes[idx]
    }

    fn index(&self, id: &str) -> usize {
        self.nodes
            .iter()
            .position(|n| n.id() == id)
            .unwrap_or_else(|| panic!("no node {}", id))
    }

    /// Liefert Nachrichten aus, bis der Raum zur Ruhe kommt
    pub async fn settle(&mut self) {
        for _ in 0..100 {
            let mut moved = false;

            for idx in 0..self.nodes.len() {
                moved |= self.nodes[idx].pump_sessions().await;
            }

            for idx in 0..self.nodes.len() {
                let from = self.nodes[idx].id();
                for message in self.nodes[idx].sink.take() {
                    moved = true;
                    self.route(&from, message).await;
                }
            }

            if !moved {
                return;
            }
        }
        panic!("mesh did not settle");
    }

    /// Meldet alle ausgehandelten Sessions als verbunden
    pub async fn connect_all_transports(&mut self) {
        for node in &self.nodes {
            for session in node.factory.all() {
                if session.is_negotiated() {
                    session.notify_transport(TransportState::Connected);
                }
            }
        }
        self.settle().await;
    }

    /// Verbindung eines Clients reißt ab; der Relay meldet den Leave
    pub async fn drop_participant(&mut self, id: &str) {
        self.offline.insert(id.to_string());
        self.node(id).sink.set_online(false);
        if self.members.remove(id).is_some() {
            self.broadcast(id, SignalMessage::ParticipantLeft {
                participant_id: id.to_string(),
            })
            .await;
        }
        self.settle().await;
    }

    /// Liefert eine Nachricht an genau einen Client, am Relay vorbei
    pub async fn deliver(&mut self, to: &str, message: SignalMessage) {
        self.node(to).coordinator.handle_signal(message).await;
    }

    async fn route(&mut self, from: &str, message: SignalMessage) {
        match &message {
            SignalMessage::Announce(_) => return,
            SignalMessage::RosterRequest => {
                let reply = SignalMessage::Roster {
                    call_id: self.call_id.clone(),
                    participants: self.members.values().cloned().collect(),
                };
                self.deliver(from, reply).await;
                return;
            }
            SignalMessage::ParticipantJoined(info) => {
                self.members
                    .insert(info.participant_id.clone(), info.clone());
            }
            SignalMessage::ParticipantLeft { participant_id } => {
                self.members.remove(participant_id);
            }
            SignalMessage::CallStarted { call_id, .. } => {
                self.call_id = Some(call_id.clone());
            }
            SignalMessage::CallEnded { .. } => {
                self.call_id = None;
                self.members.clear();
            }
            _ => {}
        }

        if let Some(target) = message.negotiation_target().map(str::to_string) {
            if !self.offline.contains(&target) {
                self.deliver(&target, message).await;
            }
            return;
        }
        self.broadcast(from, message).await;
    }

    async fn broadcast(&mut self, from: &str, message: SignalMessage) {
        for idx in 0..self.nodes.len() {
            let id = self.nodes[idx].id();
            if id == from || self.offline.contains(&id) {
                continue;
            }
            self.nodes[idx]
                .coordinator
                .handle_signal(message.clone())
                .await;
        }
    }
}
