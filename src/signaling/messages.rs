//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht wird als `{"topic": "...", "payload": {...}}` übertragen.
//! Statt string-basierter Handler gibt es ein geschlossenes Enum: Empfänger
//! matchen vollständig auf [`SignalMessage`], der Compiler prüft, dass kein
//! Topic vergessen wird.

use serde::{Deserialize, Serialize};

// ============================================================================
// PAYLOAD TYPES
// ============================================================================

/// Identität eines Teilnehmers, wie sie über den Relay verteilt wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub participant_id: String,
    pub display_name: String,
    pub is_elevated: bool,
    /// Vom Relay vergebene Verbindungs-ID, ändert sich bei jedem Reconnect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<String>,
}

impl ParticipantInfo {
    pub fn new(participant_id: String, display_name: String, is_elevated: bool) -> Self {
        Self {
            participant_id,
            display_name,
            is_elevated,
            endpoint_id: None,
        }
    }
}

/// ICE Candidate im Browser-kompatiblen JSON-Format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Chat-Nachricht innerhalb eines Calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub call_id: String,
    pub sender_id: String,
    pub display_name: String,
    pub is_elevated: bool,
    pub body: String,
    /// Millisekunden seit Unix-Epoch
    pub timestamp: i64,
}

// ============================================================================
// SIGNAL MESSAGES
// ============================================================================

/// Alle Nachrichten zwischen Client und Relay (beide Richtungen)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "topic",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SignalMessage {
    /// Identität bei jedem (Re-)Connect; der Relay behandelt Duplikate als Refresh
    Announce(ParticipantInfo),

    /// Teilnehmer ist dem Call beigetreten
    ParticipantJoined(ParticipantInfo),

    /// Teilnehmer hat den Call verlassen oder die Verbindung verloren
    ParticipantLeft { participant_id: String },

    /// Call wurde von einem berechtigten Teilnehmer gestartet
    CallStarted {
        call_id: String,
        started_by: String,
        timestamp: i64,
    },

    /// Call wurde beendet
    CallEnded { call_id: String },

    /// SDP Offer an genau einen Teilnehmer
    SessionOffer {
        from_participant_id: String,
        target_participant_id: String,
        description: String,
    },

    /// SDP Answer an genau einen Teilnehmer
    SessionAnswer {
        from_participant_id: String,
        target_participant_id: String,
        description: String,
    },

    /// Trickle-ICE Candidate an genau einen Teilnehmer
    IceCandidate {
        from_participant_id: String,
        target_participant_id: String,
        candidate: Candidate,
    },

    /// Chat im Raum
    ChatMessage(ChatPayload),

    /// Alle anderen Teilnehmer sollen ihr Mikrofon stummschalten
    MuteAll {
        call_id: String,
        requested_by: String,
    },

    /// Fordert den aktuellen Raumzustand an
    RosterRequest,

    /// Antwort auf `roster-request`: aktiver Call und alle Teilnehmer darin
    Roster {
        #[serde(default)]
        call_id: Option<String>,
        participants: Vec<ParticipantInfo>,
    },
}

impl SignalMessage {
    pub fn offer(from: &str, target: &str, description: String) -> Self {
        Self::SessionOffer {
            from_participant_id: from.to_string(),
            target_participant_id: target.to_string(),
            description,
        }
    }

    pub fn answer(from: &str, target: &str, description: String) -> Self {
        Self::SessionAnswer {
            from_participant_id: from.to_string(),
            target_participant_id: target.to_string(),
            description,
        }
    }

    pub fn candidate(from: &str, target: &str, candidate: Candidate) -> Self {
        Self::IceCandidate {
            from_participant_id: from.to_string(),
            target_participant_id: target.to_string(),
            candidate,
        }
    }

    /// Topic-Name wie auf dem Draht
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Announce(_) => "announce",
            Self::ParticipantJoined(_) => "participant-joined",
            Self::ParticipantLeft { .. } => "participant-left",
            Self::CallStarted { .. } => "call-started",
            Self::CallEnded { .. } => "call-ended",
            Self::SessionOffer { .. } => "session-offer",
            Self::SessionAnswer { .. } => "session-answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::ChatMessage(_) => "chat-message",
            Self::MuteAll { .. } => "mute-all",
            Self::RosterRequest => "roster-request",
            Self::Roster { .. } => "roster",
        }
    }

    /// Absender einer gezielten Negotiation-Nachricht
    pub fn negotiation_sender(&self) -> Option<&str> {
        match self {
            Self::SessionOffer {
                from_participant_id,
                ..
            }
            | Self::SessionAnswer {
                from_participant_id,
                ..
            }
            | Self::IceCandidate {
                from_participant_id,
                ..
            } => Some(from_participant_id),
            _ => None,
        }
    }

    /// Empfänger einer gezielten Negotiation-Nachricht
    pub fn negotiation_target(&self) -> Option<&str> {
        match self {
            Self::SessionOffer {
                target_participant_id,
                ..
            }
            | Self::SessionAnswer {
                target_participant_id,
                ..
            }
            | Self::IceCandidate {
                target_participant_id,
                ..
            } => Some(target_participant_id),
            _ => None,
        }
    }
}
