//! Roster und Call-Session
//!
//! Die einzige autoritative Kopie der Teilnehmerliste liegt beim Coordinator.

use crate::signaling::{ChatPayload, ParticipantInfo};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Chat-Nachricht im Transcript
pub type ChatMessage = ChatPayload;

/// Identität des lokalen Teilnehmers, vom Auth-Kollaborateur geliefert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub participant_id: String,
    pub display_name: String,
    pub is_elevated: bool,
}

impl LocalIdentity {
    pub fn new(participant_id: String, display_name: String, is_elevated: bool) -> Self {
        Self {
            participant_id,
            display_name,
            is_elevated,
        }
    }

    pub fn to_info(&self) -> ParticipantInfo {
        ParticipantInfo::new(
            self.participant_id.clone(),
            self.display_name.clone(),
            self.is_elevated,
        )
    }
}

// ============================================================================
// PARTICIPANTS
// ============================================================================

/// Verbindungs-Indikator für die Kachel eines Teilnehmers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionIndicator {
    Pending,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub is_elevated: bool,
    pub endpoint_id: Option<String>,
    pub is_self: bool,
    pub connection: ConnectionIndicator,
}

impl Participant {
    pub fn from_info(info: &ParticipantInfo, is_self: bool) -> Self {
        Self {
            id: info.participant_id.clone(),
            display_name: info.display_name.clone(),
            is_elevated: info.is_elevated,
            endpoint_id: info.endpoint_id.clone(),
            is_self,
            connection: if is_self {
                ConnectionIndicator::Connected
            } else {
                ConnectionIndicator::Pending
            },
        }
    }
}

/// Ergebnis von [`Roster::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterChange {
    Added,
    /// Name oder Rolle aktualisiert
    Refreshed,
    /// Remote hat sich neu verbunden, Link muss neu aufgebaut werden
    EndpointChanged,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct Roster {
    participants: BTreeMap<String, Participant>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, info: &ParticipantInfo, is_self: bool) -> RosterChange {
        let Some(existing) = self.participants.get_mut(&info.participant_id) else {
            self.participants
                .insert(info.participant_id.clone(), Participant::from_info(info, is_self));
            return RosterChange::Added;
        };

        let endpoint_changed = matches!(
            (&existing.endpoint_id, &info.endpoint_id),
            (Some(old), Some(new)) if old != new
        );
        let refreshed = existing.display_name != info.display_name
            || existing.is_elevated != info.is_elevated
            || (existing.endpoint_id.is_none() && info.endpoint_id.is_some());

        existing.display_name = info.display_name.clone();
        existing.is_elevated = info.is_elevated;
        if info.endpoint_id.is_some() {
            existing.endpoint_id = info.endpoint_id.clone();
        }

        if endpoint_changed {
            existing.connection = ConnectionIndicator::Pending;
            RosterChange::EndpointChanged
        } else if refreshed {
            RosterChange::Refreshed
        } else {
            RosterChange::Unchanged
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        self.participants.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.participants.contains_key(id)
    }

    /// Alle Teilnehmer außer uns selbst
    pub fn remote_ids(&self) -> Vec<String> {
        self.participants
            .values()
            .filter(|p| !p.is_self)
            .map(|p| p.id.clone())
            .collect()
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Setzt den Indikator; `true` wenn er sich geändert hat
    pub fn set_connection(&mut self, id: &str, connection: ConnectionIndicator) -> bool {
        match self.participants.get_mut(id) {
            Some(p) if p.connection != connection => {
                p.connection = connection;
                true
            }
            _ => false,
        }
    }

    pub fn is_elevated(&self, id: &str) -> bool {
        self.participants
            .get(id)
            .map(|p| p.is_elevated)
            .unwrap_or(false)
    }

    pub fn has_remotes(&self) -> bool {
        self.participants.values().any(|p| !p.is_self)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallLifecycle {
    NotStarted,
    Active,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub id: String,
    pub lifecycle: CallLifecycle,
    pub started_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    /// Neue Session mit frischer ID
    pub fn start(started_by: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            lifecycle: CallLifecycle::Active,
            started_by: Some(started_by.to_string()),
            created_at: Utc::now(),
        }
    }

    /// Session, von der wir über den Relay erfahren haben
    pub fn observed(id: String, started_by: Option<String>, timestamp_ms: Option<i64>) -> Self {
        let created_at = timestamp_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);
        Self {
            id,
            lifecycle: CallLifecycle::Active,
            started_by,
            created_at,
        }
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == CallLifecycle::Active
    }
}
