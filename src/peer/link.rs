//! Zustandsmaschine einer Peer-Verbindung
//!
//! Ein Link pro Remote-Teilnehmer. Übergänge passieren nur über
//! [`LinkState::apply`]; ungültige Übergänge sind Protokollfehler und lassen
//! den Zustand unverändert.

use super::session::MediaSession;
use crate::signaling::Candidate;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid transition: {event} in state {state}")]
    InvalidTransition { state: String, event: String },

    #[error("No link to participant {0}")]
    UnknownLink(String),

    #[error("Message not addressed to us: {0}")]
    Misrouted(String),

    #[error("Incoming offer from {0} discarded, we are the initiator")]
    GlareDiscarded(String),
}

// ============================================================================
// IDENTITY & ROLE
// ============================================================================

/// Identität einer Session-Inkarnation
///
/// Wird bei jedem Neuaufbau der Session neu vergeben; Callbacks alter
/// Sessions lassen sich daran erkennen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Die lexikographisch kleinere ID initiiert
    pub fn for_pair(local_id: &str, remote_id: &str) -> Self {
        if local_id < remote_id {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    New,
    Offering,
    Answering,
    Negotiating,
    Connected,
    Failed { reason: String },
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    TransportConnected,
    TransportFailed(String),
    TimedOut,
    Close,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed { .. } | LinkState::Closed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::New => "new",
            LinkState::Offering => "offering",
            LinkState::Answering => "answering",
            LinkState::Negotiating => "negotiating",
            LinkState::Connected => "connected",
            LinkState::Failed { .. } => "failed",
            LinkState::Closed => "closed",
        }
    }

    /// Berechnet den Folgezustand, ohne `self` zu verändern
    pub fn apply(&self, event: &LinkEvent) -> Result<LinkState, ProtocolError> {
        use LinkEvent as E;
        use LinkState as S;

        let next = match (self, event) {
            (_, E::Close) => S::Closed,
            (state, _) if state.is_terminal() => return Err(self.invalid(event)),

            (S::New, E::OfferSent) => S::Offering,
            (S::New, E::OfferReceived) => S::Answering,
            (S::Answering, E::AnswerSent) => S::Negotiating,
            (S::Offering, E::AnswerReceived) => S::Negotiating,

            (S::Answering | S::Negotiating | S::Connected, E::TransportConnected) => S::Connected,

            (_, E::TransportFailed(reason)) => S::Failed {
                reason: reason.clone(),
            },
            (S::Connected, E::TimedOut) => return Err(self.invalid(event)),
            (_, E::TimedOut) => S::Failed {
                reason: "negotiation timed out".to_string(),
            },

            _ => return Err(self.invalid(event)),
        };

        Ok(next)
    }

    fn invalid(&self, event: &LinkEvent) -> ProtocolError {
        ProtocolError::InvalidTransition {
            state: self.as_str().to_string(),
            event: format!("{:?}", event),
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Failed { reason } => write!(f, "failed ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

// ============================================================================
// PEER LINK
// ============================================================================

/// Verbindung zu genau einem Remote-Teilnehmer
pub struct PeerLink {
    pub id: LinkId,
    pub remote: String,
    pub role: Role,
    pub state: LinkState,
    pub session: Arc<dyn MediaSession>,
    pub remote_description_set: bool,
    pub local_description_sent: bool,
    /// Remote Candidates, die vor der Remote Description ankamen
    pub pending_remote: Vec<Candidate>,
    /// Lokale Candidates, die vor dem Versand der Local Description entstanden
    pub pending_local: Vec<Candidate>,
    /// Bei Glare verworfenes Remote-Offer: dessen Candidates bis zur Answer ignorieren
    pub remote_offer_discarded: bool,
    pub opened_at: Instant,
}

impl PeerLink {
    pub fn new(id: LinkId, remote: String, role: Role, session: Arc<dyn MediaSession>) -> Self {
        Self {
            id,
            remote,
            role,
            state: LinkState::New,
            session,
            remote_description_set: false,
            local_description_sent: false,
            pending_remote: Vec::new(),
            pending_local: Vec::new(),
            remote_offer_discarded: false,
            opened_at: Instant::now(),
        }
    }

    /// Wendet ein Event an; bei Fehlern bleibt der Zustand erhalten
    pub fn advance(&mut self, event: LinkEvent) -> Result<&LinkState, ProtocolError> {
        self.state = self.state.apply(&event)?;
        Ok(&self.state)
    }

    /// Hängt die Aushandlung länger als `timeout`?
    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        !self.state.is_connected()
            && !self.state.is_terminal()
            && now.saturating_duration_since(self.opened_at) >= timeout
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("pending_remote", &self.pending_remote.len())
            .field("pending_local", &self.pending_local.len())
            .finish()
    }
}
