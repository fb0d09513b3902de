//! Call Session Coordinator
//!
//! Einzige Quelle der Wahrheit dafür, wer im Call ist und welche Peers
//! miteinander verbunden sein sollen. Reagiert auf Signaling-Nachrichten,
//! Session-Callbacks und Befehle der Oberfläche; alles läuft nacheinander in
//! der Engine-Loop.

use super::engine::{CallEngineError, CallEvent};
use super::media::{LocalMedia, MediaMode};
use super::roster::{
    CallLifecycle, CallSession, ChatMessage, ConnectionIndicator, LocalIdentity, Participant,
    Roster, RosterChange,
};
use super::audio::MediaError;
use crate::config::CallConfig;
use crate::peer::{
    LinkState, PeerConnectionManager, PeerError, Role, SessionEvent, SessionFactory,
};
use crate::signaling::{ChatPayload, ParticipantInfo, SignalMessage, SignalSink};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Höchstzahl geparkter Negotiation-Nachrichten pro Absender
const MAX_PARKED_PER_SENDER: usize = 64;

/// Ergebnis von [`CallCoordinator::join_call`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub call_id: String,
    pub mode: MediaMode,
    /// Gesetzt wenn ohne Mikrofon beigetreten wurde
    pub device_error: Option<MediaError>,
}

/// Ergebnis von [`CallCoordinator::start_call`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(JoinOutcome),
    AlreadyActive { call_id: String },
}

/// Momentaufnahme für die Oberfläche
#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub call: Option<CallSession>,
    pub in_call: bool,
    pub participants: Vec<Participant>,
    /// (Teilnehmer, Link-Zustand)
    pub links: Vec<(String, String)>,
    pub muted: bool,
    pub media_mode: Option<MediaMode>,
    pub transcript: Vec<ChatMessage>,
}

pub struct CallCoordinator {
    identity: LocalIdentity,
    config: CallConfig,
    sink: Arc<dyn SignalSink>,
    peers: PeerConnectionManager,
    roster: Roster,
    call: Option<CallSession>,
    in_call: bool,
    media: Option<LocalMedia>,
    transcript: Vec<ChatMessage>,
    /// Negotiation von Absendern, deren Join noch nicht da ist
    parked: HashMap<String, Vec<SignalMessage>>,
    /// Abgemeldete Teilnehmer; ihre Nachrichten werden bis zum Rejoin verworfen
    departed: HashSet<String>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallCoordinator {
    pub fn new(
        identity: LocalIdentity,
        config: CallConfig,
        factory: Arc<dyn SessionFactory>,
        sink: Arc<dyn SignalSink>,
        event_tx: broadcast::Sender<CallEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (peers, session_rx) = PeerConnectionManager::new(
            identity.participant_id.clone(),
            factory,
            Arc::clone(&sink),
            config.negotiation,
            event_tx.clone(),
        );

        let coordinator = Self {
            identity,
            config,
            sink,
            peers,
            roster: Roster::new(),
            call: None,
            in_call: false,
            media: None,
            transcript: Vec::new(),
            parked: HashMap::new(),
            departed: HashSet::new(),
            event_tx,
        };
        (coordinator, session_rx)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    /// Aktive Session, falls vorhanden
    pub fn active_call(&self) -> Option<&CallSession> {
        self.call.as_ref().filter(|c| c.is_active())
    }

    pub fn lifecycle(&self) -> CallLifecycle {
        self.call
            .as_ref()
            .map(|c| c.lifecycle)
            .unwrap_or(CallLifecycle::NotStarted)
    }

    pub fn is_in_call(&self) -> bool {
        self.in_call
    }

    pub fn media(&self) -> Option<&LocalMedia> {
        self.media.as_ref()
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn parked_count(&self, sender: &str) -> usize {
        self.parked.get(sender).map(Vec::len).unwrap_or(0)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let mut links: Vec<(String, String)> = self
            .peers
            .remotes()
            .into_iter()
            .filter_map(|r| {
                let state = self.peers.link_state(&r)?;
                Some((r, state.as_str().to_string()))
            })
            .collect();
        links.sort();

        CallSnapshot {
            call: self.call.clone(),
            in_call: self.in_call,
            participants: self.roster.participants().cloned().collect(),
            links,
            muted: self.media.as_ref().map(|m| m.is_muted()).unwrap_or(false),
            media_mode: self.media.as_ref().map(|m| m.mode()),
            transcript: self.transcript.clone(),
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Startet einen Call (nur berechtigte Teilnehmer) und tritt ihm bei
    pub async fn start_call(&mut self) -> Result<StartOutcome, CallEngineError> {
        if !self.identity.is_elevated {
            return Err(CallEngineError::NotElevated("start a call"));
        }
        if let Some(active) = self.active_call() {
            tracing::info!("Call {} already active, start ignored", active.id);
            return Ok(StartOutcome::AlreadyActive {
                call_id: active.id.clone(),
            });
        }

        let session = CallSession::start(&self.identity.participant_id);
        tracing::info!("Starting call {}", session.id);
        self.sink.send(SignalMessage::CallStarted {
            call_id: session.id.clone(),
            started_by: self.identity.participant_id.clone(),
            timestamp: session.created_at.timestamp_millis(),
        });
        self.emit(CallEvent::CallStarted {
            call_id: session.id.clone(),
            started_by: Some(self.identity.participant_id.clone()),
        });
        self.call = Some(session);

        let joined = self.join_call().await?;
        Ok(StartOutcome::Started(joined))
    }

    /// Tritt dem aktiven Call bei; mehrfacher Aufruf ist harmlos
    pub async fn join_call(&mut self) -> Result<JoinOutcome, CallEngineError> {
        let call_id = self
            .active_call()
            .map(|c| c.id.clone())
            .ok_or(CallEngineError::NoActiveCall)?;

        if self.in_call {
            return Ok(JoinOutcome {
                call_id,
                mode: self
                    .media
                    .as_ref()
                    .map(|m| m.mode())
                    .unwrap_or(MediaMode::ObserveOnly),
                device_error: None,
            });
        }

        let media =
            LocalMedia::acquire(self.config.capture, self.config.speaking_threshold).await;
        let device_error = media.degradation().cloned();
        if let Some(e) = &device_error {
            self.emit(CallEvent::DeviceUnavailable {
                reason: e.to_string(),
            });
        }
        let mode = media.mode();
        self.peers.set_local_tracks(media.tracks().clone());
        self.media = Some(media);
        self.in_call = true;

        let info = self.identity.to_info();
        self.roster.upsert(&info, true);
        self.sink.send(SignalMessage::ParticipantJoined(info));
        tracing::info!("Joined call {} ({:?})", call_id, mode);

        // Bestehende Teilnehmer initiieren zu uns, wir warten als Responder
        for remote in self.roster.remote_ids() {
            if let Err(e) = self.peers.open(&remote, Role::Responder).await {
                tracing::warn!("Failed to open link to {}: {}", remote, e);
            }
        }
        self.sync_indicators();

        Ok(JoinOutcome {
            call_id,
            mode,
            device_error,
        })
    }

    /// Verlässt den Call; die Session läuft für die anderen weiter
    pub async fn leave_call(&mut self) -> Result<(), CallEngineError> {
        if !self.in_call {
            return Ok(());
        }

        self.sink.send(SignalMessage::ParticipantLeft {
            participant_id: self.identity.participant_id.clone(),
        });
        self.release_call_resources().await;
        self.roster.remove(&self.identity.participant_id);
        tracing::info!("Left call");

        // Als Letzter gegangen: der Call ist vorbei
        if self.roster.is_empty() {
            if let Some(call_id) = self.active_call().map(|c| c.id.clone()) {
                tracing::info!("Last participant left, call {} ended", call_id);
                self.teardown_call(call_id).await;
            }
        }
        self.sync_indicators();
        Ok(())
    }

    /// Beendet den Call für alle (nur berechtigte Teilnehmer)
    pub async fn end_call(&mut self) -> Result<(), CallEngineError> {
        if !self.identity.is_elevated {
            return Err(CallEngineError::NotElevated("end the call"));
        }
        let call_id = self
            .active_call()
            .map(|c| c.id.clone())
            .ok_or(CallEngineError::NoActiveCall)?;

        self.sink.send(SignalMessage::CallEnded {
            call_id: call_id.clone(),
        });
        self.teardown_call(call_id).await;
        Ok(())
    }

    /// Schaltet nur das Mikrofon-Flag um, ohne Neuverhandlung
    pub fn set_muted(&mut self, muted: bool) -> Result<(), CallEngineError> {
        let media = self.media.as_ref().ok_or(CallEngineError::NotInCall)?;
        media.set_muted(muted);
        self.emit(CallEvent::MuteChanged { muted });
        Ok(())
    }

    pub fn set_video_enabled(&mut self, enabled: bool) -> Result<(), CallEngineError> {
        let media = self.media.as_ref().ok_or(CallEngineError::NotInCall)?;
        media.set_video_enabled(enabled);
        Ok(())
    }

    /// Fordert alle anderen auf, sich stummzuschalten
    pub fn mute_all(&mut self) -> Result<bool, CallEngineError> {
        if !self.identity.is_elevated {
            return Err(CallEngineError::NotElevated("mute everyone"));
        }
        let call_id = self
            .active_call()
            .map(|c| c.id.clone())
            .ok_or(CallEngineError::NoActiveCall)?;

        Ok(self.sink.send(SignalMessage::MuteAll {
            call_id,
            requested_by: self.identity.participant_id.clone(),
        }))
    }

    /// Sendet eine Chat-Nachricht
    ///
    /// Lokal angehängt wird nur, was der Kanal angenommen hat.
    pub fn send_chat(&mut self, body: &str) -> Result<Option<ChatMessage>, CallEngineError> {
        let call_id = self
            .active_call()
            .map(|c| c.id.clone())
            .ok_or(CallEngineError::NoActiveCall)?;

        let body = body.trim();
        if body.is_empty() {
            return Ok(None);
        }

        let message = ChatPayload {
            call_id,
            sender_id: self.identity.participant_id.clone(),
            display_name: self.identity.display_name.clone(),
            is_elevated: self.identity.is_elevated,
            body: body.to_string(),
            timestamp: Utc::now().timestamp_millis(),
        };

        if !self.sink.send(SignalMessage::ChatMessage(message.clone())) {
            tracing::warn!("Chat message not delivered, signaling offline");
            return Ok(None);
        }
        self.transcript.push(message.clone());
        Ok(Some(message))
    }

    /// Fragt den Relay nach dem aktuellen Raumzustand
    pub fn refresh_roster(&mut self) -> bool {
        self.sink.send(SignalMessage::RosterRequest)
    }

    pub fn on_signaling_connected(&mut self, reconnect: bool) {
        tracing::info!("Signaling connected (reconnect: {})", reconnect);
        self.emit(CallEvent::SignalingConnected);
        self.refresh_roster();
    }

    /// Links bleiben bestehen, Media läuft direkt zwischen den Peers
    pub fn on_signaling_disconnected(&mut self) {
        tracing::warn!("Signaling disconnected");
        self.emit(CallEvent::SignalingDisconnected);
    }

    pub async fn handle_session_event(&mut self, event: SessionEvent) {
        let remote = event.remote.clone();
        self.peers.handle_session_event(event).await;
        self.sync_indicator(&remote);
    }

    /// Timer: hängende Aushandlungen beenden
    pub async fn tick(&mut self, now: Instant) {
        for remote in self.peers.expire_stalled(now).await {
            self.sync_indicator(&remote);
        }
    }

    /// Räumt alles ab, z.B. beim Beenden der Engine
    pub async fn shutdown(&mut self) {
        if self.in_call {
            if let Err(e) = self.leave_call().await {
                tracing::warn!("Leave during shutdown failed: {}", e);
            }
        }
        self.peers.close_all().await;
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    pub async fn handle_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::Announce(_) | SignalMessage::RosterRequest => {
                tracing::debug!("Ignoring client-to-relay message {}", message.topic());
            }
            SignalMessage::ParticipantJoined(info) => self.on_participant_joined(info).await,
            SignalMessage::ParticipantLeft { participant_id } => {
                self.on_participant_left(&participant_id).await
            }
            SignalMessage::CallStarted {
                call_id,
                started_by,
                timestamp,
            } => self.on_call_started(call_id, started_by, timestamp),
            SignalMessage::CallEnded { call_id } => self.on_call_ended(call_id).await,
            SignalMessage::SessionOffer { .. }
            | SignalMessage::SessionAnswer { .. }
            | SignalMessage::IceCandidate { .. } => self.on_negotiation(message).await,
            SignalMessage::ChatMessage(payload) => self.on_chat(payload),
            SignalMessage::MuteAll {
                call_id,
                requested_by,
            } => self.on_mute_all(call_id, requested_by),
            SignalMessage::Roster {
                call_id,
                participants,
            } => self.on_roster(call_id, participants).await,
        }
    }

    async fn on_participant_joined(&mut self, info: ParticipantInfo) {
        let id = info.participant_id.clone();
        if id == self.identity.participant_id {
            // Echo unseres eigenen Joins
            if self.in_call {
                self.roster.upsert(&info, true);
            }
            return;
        }

        self.departed.remove(&id);
        let change = self.roster.upsert(&info, false);
        tracing::info!("Participant {} joined ({:?})", id, change);
        if change != RosterChange::Unchanged {
            if let Some(participant) = self.roster.get(&id).cloned() {
                self.emit(CallEvent::ParticipantJoined(participant));
            }
        }

        if self.in_call {
            // Bestehender Teilnehmer initiiert zum neuen
            let result = if change == RosterChange::EndpointChanged {
                self.rebuild_for_endpoint(&id).await
            } else {
                self.peers.open(&id, Role::Initiator).await.map(|_| ())
            };
            if let Err(e) = result {
                tracing::warn!("Failed to open link to {}: {}", id, e);
            }
        } else if change == RosterChange::EndpointChanged {
            self.peers.close(&id).await;
        }

        self.replay_parked(&id).await;
        self.sync_indicator(&id);
    }

    async fn on_participant_left(&mut self, id: &str) {
        if id == self.identity.participant_id {
            tracing::debug!("Ignoring echo of our own leave");
            return;
        }

        self.departed.insert(id.to_string());
        if let Some(dropped) = self.parked.remove(id) {
            tracing::debug!("Dropping {} parked messages from {}", dropped.len(), id);
        }
        // Link im selben Handler abbauen, in dem der Teilnehmer verschwindet
        self.peers.close(id).await;
        if self.roster.remove(id).is_none() {
            tracing::debug!("Leave of unknown participant {}", id);
            return;
        }
        tracing::info!("Participant {} left", id);
        self.emit(CallEvent::ParticipantLeft {
            participant_id: id.to_string(),
        });

        if self.roster.is_empty() {
            if let Some(call_id) = self.active_call().map(|c| c.id.clone()) {
                tracing::info!("Roster empty, call {} ended", call_id);
                self.teardown_call(call_id).await;
            }
        }
    }

    fn on_call_started(&mut self, call_id: String, started_by: String, timestamp: i64) {
        if let Some(active) = self.active_call() {
            if active.id == call_id {
                tracing::debug!("Duplicate call-started for {}", call_id);
            } else {
                tracing::warn!(
                    "Discarding call-started for {} while {} is active",
                    call_id,
                    active.id
                );
            }
            return;
        }

        tracing::info!("Call {} started by {}", call_id, started_by);
        self.call = Some(CallSession::observed(
            call_id.clone(),
            Some(started_by.clone()),
            Some(timestamp),
        ));
        self.emit(CallEvent::CallStarted {
            call_id,
            started_by: Some(started_by),
        });
    }

    async fn on_call_ended(&mut self, call_id: String) {
        match self.active_call() {
            Some(active) if active.id == call_id => {
                tracing::info!("Call {} ended", call_id);
                self.teardown_call(call_id).await;
            }
            _ => tracing::debug!("Ignoring call-ended for unknown call {}", call_id),
        }
    }

    async fn on_negotiation(&mut self, message: SignalMessage) {
        let (Some(from), Some(target)) = (
            message.negotiation_sender().map(str::to_string),
            message.negotiation_target(),
        ) else {
            return;
        };

        if target != self.identity.participant_id {
            tracing::warn!(
                "Discarding {} from {} addressed to {}",
                message.topic(),
                from,
                target
            );
            return;
        }
        if !self.in_call {
            tracing::debug!("Not in a call, dropping {} from {}", message.topic(), from);
            return;
        }
        if !self.roster.contains(&from) {
            // Answers setzen ein eigenes Offer voraus, also einen bekannten Absender
            if self.departed.contains(&from)
                || matches!(message, SignalMessage::SessionAnswer { .. })
            {
                tracing::debug!("Dropping {} from unknown sender {}", message.topic(), from);
            } else {
                self.park(from, message);
            }
            return;
        }

        let topic = message.topic();
        let result = match message {
            SignalMessage::SessionOffer { description, .. } => {
                self.peers.handle_offer(&from, &description).await
            }
            SignalMessage::SessionAnswer { description, .. } => {
                self.peers.handle_answer(&from, &description).await
            }
            SignalMessage::IceCandidate { candidate, .. } => {
                self.peers.handle_remote_candidate(&from, candidate).await
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!("Discarding {} from {}: {}", topic, from, e);
        }
        self.sync_indicator(&from);
    }

    fn on_chat(&mut self, payload: ChatPayload) {
        let Some(active) = self.active_call() else {
            tracing::debug!("Chat without active call dropped");
            return;
        };
        if payload.call_id != active.id {
            tracing::debug!("Chat for other call {} dropped", payload.call_id);
            return;
        }
        if payload.sender_id == self.identity.participant_id {
            return;
        }

        self.transcript.push(payload.clone());
        self.emit(CallEvent::ChatReceived(payload));
    }

    fn on_mute_all(&mut self, call_id: String, requested_by: String) {
        if requested_by == self.identity.participant_id {
            return;
        }
        if self.active_call().map(|c| c.id.as_str()) != Some(call_id.as_str()) {
            tracing::debug!("mute-all for other call {} ignored", call_id);
            return;
        }
        if !self.roster.is_elevated(&requested_by) {
            tracing::warn!("Ignoring mute-all from non-elevated {}", requested_by);
            return;
        }
        let Some(media) = &self.media else {
            return;
        };

        media.set_muted(true);
        tracing::info!("Muted by moderator {}", requested_by);
        self.emit(CallEvent::MutedByModerator { by: requested_by });
        self.emit(CallEvent::MuteChanged { muted: true });
    }

    /// Gleicht Call und Roster mit dem Stand des Relays ab
    async fn on_roster(&mut self, call_id: Option<String>, participants: Vec<ParticipantInfo>) {
        let local_id = self.identity.participant_id.clone();

        let active_id = self.active_call().map(|c| c.id.clone());
        match (call_id, active_id) {
            (Some(relay_id), None) => {
                self.call = Some(CallSession::observed(relay_id.clone(), None, None));
                self.emit(CallEvent::CallStarted {
                    call_id: relay_id,
                    started_by: None,
                });
            }
            (Some(relay_id), Some(active_id)) if relay_id != active_id => {
                tracing::warn!("Relay reports call {} instead of {}", relay_id, active_id);
                self.teardown_call(active_id).await;
                self.call = Some(CallSession::observed(relay_id.clone(), None, None));
                self.emit(CallEvent::CallStarted {
                    call_id: relay_id,
                    started_by: None,
                });
            }
            (None, Some(active_id)) => {
                tracing::info!("Relay has no call, {} is over", active_id);
                self.teardown_call(active_id).await;
            }
            _ => {}
        }

        // Verschwundene Teilnehmer entfernen, der Call läuft weiter
        let listed: HashSet<&str> = participants
            .iter()
            .map(|p| p.participant_id.as_str())
            .collect();
        for vanished in self.roster.remote_ids() {
            if !listed.contains(vanished.as_str()) {
                self.parked.remove(&vanished);
                self.departed.insert(vanished.clone());
                self.peers.close(&vanished).await;
                self.roster.remove(&vanished);
                tracing::info!("Participant {} vanished during resync", vanished);
                self.emit(CallEvent::ParticipantLeft {
                    participant_id: vanished,
                });
            }
        }

        let mut self_listed = false;
        for info in &participants {
            let id = info.participant_id.clone();
            if id == local_id {
                self_listed = true;
                if self.in_call {
                    self.roster.upsert(info, true);
                }
                continue;
            }

            self.departed.remove(&id);
            let change = self.roster.upsert(info, false);
            if change != RosterChange::Unchanged {
                if let Some(participant) = self.roster.get(&id).cloned() {
                    self.emit(CallEvent::ParticipantJoined(participant));
                }
            }
            if self.in_call {
                self.resync_link(&id, change).await;
            }
            self.replay_parked(&id).await;
        }

        if self.in_call && !self_listed && self.active_call().is_some() {
            tracing::info!("Relay forgot us, re-announcing join");
            self.sink
                .send(SignalMessage::ParticipantJoined(self.identity.to_info()));
        }
        self.sync_indicators();
    }

    async fn resync_link(&mut self, id: &str, change: RosterChange) {
        let result = match self.peers.link_state(id) {
            _ if change == RosterChange::EndpointChanged => self.rebuild_for_endpoint(id).await,
            None => self
                .peers
                .open(id, Role::for_pair(&self.identity.participant_id, id))
                .await
                .map(|_| ()),
            Some(LinkState::Failed { .. }) => {
                if !self.peers.can_retry(id) {
                    tracing::debug!("Retry budget for {} exhausted", id);
                    return;
                }
                tracing::info!(
                    "Retrying link to {} (attempt {})",
                    id,
                    self.peers.attempts(id) + 1
                );
                self.peers.open(id, Role::Initiator).await.map(|_| ())
            }
            Some(_) => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!("Resync of link to {} failed: {}", id, e);
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Neuer Endpoint des Remotes: Link neu aufbauen, solange er nicht verbunden ist
    ///
    /// Ein verbundener Link überlebt einen Signaling-Reconnect der Gegenseite.
    /// Ist die Gegenseite tatsächlich neu gestartet, scheitert der Transport
    /// und der nächste Resync baut den Link neu auf.
    async fn rebuild_for_endpoint(&mut self, id: &str) -> Result<(), PeerError> {
        if self.peers.link_state(id) == Some(LinkState::Connected) {
            tracing::debug!("Endpoint of {} changed, keeping connected link", id);
            return Ok(());
        }
        self.peers.reopen(id, Role::Initiator).await.map(|_| ())
    }

    fn park(&mut self, from: String, message: SignalMessage) {
        let queue = self.parked.entry(from.clone()).or_default();
        if queue.len() >= MAX_PARKED_PER_SENDER {
            tracing::warn!("Too many early messages from {}, dropping {}", from, message.topic());
            return;
        }
        tracing::debug!("Parking {} from unknown sender {}", message.topic(), from);
        queue.push(message);
    }

    async fn replay_parked(&mut self, id: &str) {
        let Some(messages) = self.parked.remove(id) else {
            return;
        };
        tracing::debug!("Replaying {} parked messages from {}", messages.len(), id);
        for message in messages {
            self.on_negotiation(message).await;
        }
    }

    /// Links schließen, Media freigeben, geparkte Nachrichten verwerfen
    async fn release_call_resources(&mut self) {
        self.peers.close_all().await;
        self.parked.clear();
        self.departed.clear();
        if let Some(media) = self.media.take() {
            media.release();
        }
        self.peers.set_local_tracks(Default::default());
        self.in_call = false;
    }

    async fn teardown_call(&mut self, call_id: String) {
        self.release_call_resources().await;
        self.roster.clear();
        if let Some(call) = self.call.as_mut() {
            call.lifecycle = CallLifecycle::Ended;
        }
        self.emit(CallEvent::CallEnded { call_id });
    }

    fn sync_indicators(&mut self) {
        for remote in self.roster.remote_ids() {
            self.sync_indicator(&remote);
        }
    }

    fn sync_indicator(&mut self, remote: &str) {
        let indicator = match self.peers.link_state(remote) {
            Some(LinkState::Connected) => ConnectionIndicator::Connected,
            Some(LinkState::Failed { .. }) | Some(LinkState::Closed) => {
                ConnectionIndicator::Disconnected
            }
            _ => ConnectionIndicator::Pending,
        };
        self.roster.set_connection(remote, indicator);
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }
}

impl std::fmt::Debug for CallCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallCoordinator")
            .field("identity", &self.identity)
            .field("call", &self.call)
            .field("in_call", &self.in_call)
            .field("roster", &self.roster)
            .field("peers", &self.peers)
            .finish()
    }
}
