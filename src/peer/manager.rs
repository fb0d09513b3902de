//! Peer Connection Manager
//!
//! Hält genau einen [`PeerLink`] pro Remote-Teilnehmer und treibt die
//! Aushandlung über den Signaling-Kanal. Läuft vollständig in der
//! Engine-Loop, daher ohne eigene Locks.

use super::link::{LinkEvent, LinkId, LinkState, PeerLink, ProtocolError, Role};
use super::session::{
    LocalTracks, PeerError, SessionEvent, SessionEventKind, SessionFactory, SessionNotifier,
    TransportState,
};
use crate::call_engine::CallEvent;
use crate::config::{NegotiationPolicy, RetryPolicy};
use crate::signaling::{Candidate, SignalMessage, SignalSink};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

pub struct PeerConnectionManager {
    local_id: String,
    factory: Arc<dyn SessionFactory>,
    sink: Arc<dyn SignalSink>,
    policy: NegotiationPolicy,
    links: HashMap<String, PeerLink>,
    /// Aufbauversuche seit dem letzten erfolgreichen Connect
    attempts: HashMap<String, u32>,
    tracks: LocalTracks,
    next_link: u64,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl PeerConnectionManager {
    /// Erstellt den Manager und den Empfänger für Session-Callbacks
    pub fn new(
        local_id: String,
        factory: Arc<dyn SessionFactory>,
        sink: Arc<dyn SignalSink>,
        policy: NegotiationPolicy,
        event_tx: broadcast::Sender<CallEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        let manager = Self {
            local_id,
            factory,
            sink,
            policy,
            links: HashMap::new(),
            attempts: HashMap::new(),
            tracks: LocalTracks::default(),
            next_link: 0,
            session_tx,
            event_tx,
        };
        (manager, session_rx)
    }

    /// Tracks für alle ab jetzt erzeugten Sessions
    pub fn set_local_tracks(&mut self, tracks: LocalTracks) {
        self.tracks = tracks;
    }

    pub fn link(&self, remote: &str) -> Option<&PeerLink> {
        self.links.get(remote)
    }

    pub fn link_state(&self, remote: &str) -> Option<LinkState> {
        self.links.get(remote).map(|l| l.state.clone())
    }

    pub fn remotes(&self) -> Vec<String> {
        self.links.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn attempts(&self, remote: &str) -> u32 {
        self.attempts.get(remote).copied().unwrap_or(0)
    }

    /// Darf ein fehlgeschlagener Link bei einem Resync neu aufgebaut werden?
    pub fn can_retry(&self, remote: &str) -> bool {
        match self.policy.retry {
            RetryPolicy::Never => false,
            RetryPolicy::OnResync { max_attempts } => self.attempts(remote) < max_attempts,
        }
    }

    /// Remotes mit Link im Zustand `failed`
    pub fn failed_remotes(&self) -> Vec<String> {
        self.links
            .values()
            .filter(|l| matches!(l.state, LinkState::Failed { .. }))
            .map(|l| l.remote.clone())
            .collect()
    }

    // ========================================================================
    // OPEN / CLOSE
    // ========================================================================

    /// Öffnet einen Link zu `remote`
    ///
    /// Ein bestehender, nicht beendeter Link bleibt unverändert. Ein Link in
    /// `failed`/`closed` wird neu aufgebaut.
    pub async fn open(&mut self, remote: &str, role: Role) -> Result<LinkId, PeerError> {
        if remote == self.local_id {
            return Err(PeerError::SelfLink);
        }

        if let Some(link) = self.links.get(remote) {
            if !link.state.is_terminal() {
                tracing::debug!("Link to {} already exists ({})", remote, link.state);
                return Ok(link.id);
            }
            self.discard(remote).await;
        }

        *self.attempts.entry(remote.to_string()).or_insert(0) += 1;
        let id = self.create_link(remote, role).await?;
        tracing::info!("Opened {} to {} as {:?}", id, remote, role);

        if role == Role::Initiator {
            self.send_offer(remote).await;
        }
        Ok(id)
    }

    /// Baut den Link zu `remote` in jedem Fall neu auf
    pub async fn reopen(&mut self, remote: &str, role: Role) -> Result<LinkId, PeerError> {
        self.discard(remote).await;
        self.open(remote, role).await
    }

    /// Schließt den Link zu `remote`; `true` wenn einer existierte
    pub async fn close(&mut self, remote: &str) -> bool {
        self.attempts.remove(remote);

        // Erst aus der Arena entfernen, dann schließen: spätere Callbacks sind stale
        let Some(mut link) = self.links.remove(remote) else {
            return false;
        };
        if link.advance(LinkEvent::Close).is_ok() {
            self.emit_state(remote, &link.state);
        }
        link.session.close().await;
        tracing::info!("Closed {} to {}", link.id, remote);
        true
    }

    pub async fn close_all(&mut self) {
        for remote in self.remotes() {
            self.close(&remote).await;
        }
        self.attempts.clear();
    }

    // ========================================================================
    // INBOUND NEGOTIATION
    // ========================================================================

    pub async fn handle_offer(&mut self, from: &str, sdp: &str) -> Result<(), PeerError> {
        if from == self.local_id {
            return Err(PeerError::SelfLink);
        }

        match self.links.get(from).map(|l| l.state.clone()) {
            None => {
                self.create_link(from, Role::Responder).await?;
            }
            Some(LinkState::New) => {}
            Some(LinkState::Offering) => {
                if Role::for_pair(&self.local_id, from) == Role::Initiator {
                    // Candidates der Gegenseite gehören bis zu ihrer Answer zur verworfenen Session
                    if let Some(link) = self.links.get_mut(from) {
                        link.remote_offer_discarded = true;
                    }
                    return Err(ProtocolError::GlareDiscarded(from.to_string()).into());
                }
                tracing::info!("Glare with {}, yielding and answering", from);
                self.rebuild_as_responder(from).await?;
            }
            Some(LinkState::Answering) => {
                return Err(ProtocolError::InvalidTransition {
                    state: LinkState::Answering.as_str().to_string(),
                    event: format!("{:?}", LinkEvent::OfferReceived),
                }
                .into());
            }
            Some(state) => {
                // Remote hat seine Session neu aufgebaut
                tracing::info!("Fresh offer from {} while {}, replacing link", from, state);
                self.rebuild_as_responder(from).await?;
            }
        }

        let link = self
            .links
            .get(from)
            .ok_or_else(|| ProtocolError::UnknownLink(from.to_string()))?;
        let id = link.id;
        let session = Arc::clone(&link.session);
        link.state.apply(&LinkEvent::OfferReceived)?;

        // Kaputtes SDP: Link behält seinen Zustand
        session.apply_remote_offer(sdp).await?;
        self.advance(from, LinkEvent::OfferReceived)?;
        if let Some(link) = self.links.get_mut(from) {
            link.remote_description_set = true;
        }
        self.flush_remote(from).await;

        match session.create_answer().await {
            Ok(answer) => {
                self.advance(from, LinkEvent::AnswerSent)?;
                self.sink
                    .send(SignalMessage::answer(&self.local_id, from, answer));
                tracing::debug!("Sent answer on {} to {}", id, from);
                self.mark_local_sent(from);
                Ok(())
            }
            Err(e) => {
                self.fail(from, format!("answer failed: {}", e)).await;
                Err(e)
            }
        }
    }

    pub async fn handle_answer(&mut self, from: &str, sdp: &str) -> Result<(), PeerError> {
        let link = self
            .links
            .get(from)
            .ok_or_else(|| ProtocolError::UnknownLink(from.to_string()))?;
        let session = Arc::clone(&link.session);
        // Erst prüfen, dann anwenden: verspätete Answers landen hier
        link.state.apply(&LinkEvent::AnswerReceived)?;

        session.apply_remote_answer(sdp).await?;
        self.advance(from, LinkEvent::AnswerReceived)?;
        if let Some(link) = self.links.get_mut(from) {
            link.remote_description_set = true;
        }
        self.flush_remote(from).await;
        Ok(())
    }

    pub async fn handle_remote_candidate(
        &mut self,
        from: &str,
        candidate: Candidate,
    ) -> Result<(), PeerError> {
        if !self.links.contains_key(from) {
            // Candidate vor dem Offer: Responder-Link anlegen und puffern
            self.create_link(from, Role::Responder).await?;
        }
        let link = self
            .links
            .get_mut(from)
            .ok_or_else(|| ProtocolError::UnknownLink(from.to_string()))?;

        if link.state.is_terminal() {
            tracing::debug!("Ignoring candidate for {} link to {}", link.state, from);
            return Ok(());
        }
        if link.remote_offer_discarded && !link.remote_description_set {
            tracing::trace!("Dropping candidate for discarded offer from {}", from);
            return Ok(());
        }
        if !link.remote_description_set {
            tracing::trace!("Buffering remote candidate from {}", from);
            link.pending_remote.push(candidate);
            return Ok(());
        }

        let session = Arc::clone(&link.session);
        session.add_remote_candidate(&candidate).await
    }

    // ========================================================================
    // SESSION CALLBACKS
    // ========================================================================

    pub async fn handle_session_event(&mut self, event: SessionEvent) {
        let Some(link) = self.links.get_mut(&event.remote) else {
            tracing::debug!("Dropping event for unknown link {} ({})", event.link, event.remote);
            return;
        };
        if link.id != event.link {
            tracing::debug!(
                "Dropping stale event from {} (current {}) for {}",
                event.link,
                link.id,
                event.remote
            );
            return;
        }

        match event.kind {
            SessionEventKind::LocalCandidate(candidate) => {
                if link.state.is_terminal() {
                    return;
                }
                if link.local_description_sent {
                    self.sink.send(SignalMessage::candidate(
                        &self.local_id,
                        &event.remote,
                        candidate,
                    ));
                } else {
                    link.pending_local.push(candidate);
                }
            }
            SessionEventKind::Transport(TransportState::Connected) => {
                if self.advance(&event.remote, LinkEvent::TransportConnected).is_ok() {
                    self.attempts.remove(&event.remote);
                    tracing::info!("Connected to {}", event.remote);
                }
            }
            SessionEventKind::Transport(TransportState::Failed) => {
                self.fail(&event.remote, "transport failed".to_string())
                    .await;
            }
            SessionEventKind::Transport(TransportState::Closed) => {
                if !link.state.is_terminal() {
                    self.fail(&event.remote, "transport closed".to_string())
                        .await;
                }
            }
            SessionEventKind::Transport(state) => {
                tracing::debug!("Transport to {}: {:?}", event.remote, state);
            }
            SessionEventKind::RemoteMedia(media) => {
                let _ = self.event_tx.send(CallEvent::RemoteMedia(media));
            }
        }
    }

    /// Markiert Links als `failed`, die zu lange nicht verbunden sind
    pub async fn expire_stalled(&mut self, now: Instant) -> Vec<String> {
        let Some(timeout) = self.policy.timeout else {
            return Vec::new();
        };

        let stalled: Vec<String> = self
            .links
            .values()
            .filter(|l| l.is_stalled(now, timeout))
            .map(|l| l.remote.clone())
            .collect();

        for remote in &stalled {
            tracing::warn!("Negotiation with {} timed out after {:?}", remote, timeout);
            if self.advance(remote, LinkEvent::TimedOut).is_ok() {
                if let Some(link) = self.links.get(remote) {
                    link.session.close().await;
                }
            }
        }
        stalled
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn create_link(&mut self, remote: &str, role: Role) -> Result<LinkId, PeerError> {
        self.next_link += 1;
        let id = LinkId(self.next_link);
        let notifier = SessionNotifier::new(id, remote.to_string(), self.session_tx.clone());
        let session = self.factory.create_session(notifier, &self.tracks).await?;

        let link = PeerLink::new(id, remote.to_string(), role, session);
        self.emit_state(remote, &link.state);
        self.links.insert(remote.to_string(), link);
        Ok(id)
    }

    /// Verwirft den eigenen Versuch und baut einen Responder-Link unter neuer ID
    async fn rebuild_as_responder(&mut self, remote: &str) -> Result<LinkId, PeerError> {
        let pending = self
            .links
            .get_mut(remote)
            .filter(|l| !l.remote_description_set)
            .map(|l| std::mem::take(&mut l.pending_remote))
            .unwrap_or_default();

        self.discard(remote).await;
        let id = self.create_link(remote, Role::Responder).await?;
        if let Some(link) = self.links.get_mut(remote) {
            link.pending_remote = pending;
        }
        Ok(id)
    }

    /// Entfernt den Link ohne Close-Event, die Session wird geschlossen
    async fn discard(&mut self, remote: &str) {
        if let Some(link) = self.links.remove(remote) {
            tracing::debug!("Discarding {} to {} ({})", link.id, remote, link.state);
            link.session.close().await;
        }
    }

    async fn send_offer(&mut self, remote: &str) {
        let Some(link) = self.links.get(remote) else {
            return;
        };
        let session = Arc::clone(&link.session);

        match session.create_offer().await {
            Ok(offer) => {
                if let Err(e) = self.advance(remote, LinkEvent::OfferSent) {
                    tracing::warn!("Cannot send offer to {}: {}", remote, e);
                    return;
                }
                self.sink
                    .send(SignalMessage::offer(&self.local_id, remote, offer));
                self.mark_local_sent(remote);
            }
            Err(e) => {
                tracing::error!("Failed to create offer for {}: {}", remote, e);
                self.fail(remote, format!("offer failed: {}", e)).await;
            }
        }
    }

    /// Link nach `failed`; der Eintrag bleibt für Retry und Anzeige erhalten
    async fn fail(&mut self, remote: &str, reason: String) {
        match self.advance(remote, LinkEvent::TransportFailed(reason.clone())) {
            Ok(_) => {
                tracing::warn!("Link to {} failed: {}", remote, reason);
                if let Some(link) = self.links.get(remote) {
                    link.session.close().await;
                }
            }
            Err(e) => tracing::debug!("Not failing link to {}: {}", remote, e),
        }
    }

    fn advance(&mut self, remote: &str, event: LinkEvent) -> Result<(), ProtocolError> {
        let link = self
            .links
            .get_mut(remote)
            .ok_or_else(|| ProtocolError::UnknownLink(remote.to_string()))?;
        let state = link.advance(event)?.clone();
        self.emit_state(remote, &state);
        Ok(())
    }

    fn mark_local_sent(&mut self, remote: &str) {
        let Some(link) = self.links.get_mut(remote) else {
            return;
        };
        link.local_description_sent = true;
        for candidate in std::mem::take(&mut link.pending_local) {
            self.sink
                .send(SignalMessage::candidate(&self.local_id, remote, candidate));
        }
    }

    async fn flush_remote(&mut self, remote: &str) {
        let Some(link) = self.links.get_mut(remote) else {
            return;
        };
        let pending = std::mem::take(&mut link.pending_remote);
        let session = Arc::clone(&link.session);

        for candidate in pending {
            if let Err(e) = session.add_remote_candidate(&candidate).await {
                tracing::warn!("Failed to apply buffered candidate from {}: {}", remote, e);
            }
        }
    }

    fn emit_state(&self, remote: &str, state: &LinkState) {
        let _ = self.event_tx.send(CallEvent::LinkStateChanged {
            participant_id: remote.to_string(),
            state: state.as_str().to_string(),
        });
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("local_id", &self.local_id)
            .field("links", &self.links)
            .field("attempts", &self.attempts)
            .finish()
    }
}
