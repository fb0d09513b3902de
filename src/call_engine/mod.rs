//! Call Engine Modul - Koordination, Roster und lokale Medien
//!
//! Dieses Modul verwaltet:
//! - Call-Lebenszyklus und Teilnehmerliste
//! - Mesh-Topologie über den Peer Connection Manager
//! - Audio Capture (Mikrofon) und Mute
//! - Chat-Transcript

mod audio;
mod coordinator;
mod engine;
mod media;
mod roster;

pub use audio::{AudioHandler, MediaError, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use coordinator::{CallCoordinator, CallSnapshot, JoinOutcome, StartOutcome};
pub use engine::{CallEngine, CallEngineError, CallEvent};
pub use media::{LocalMedia, MediaConstraints, MediaMode};
pub use roster::{
    CallLifecycle, CallSession, ChatMessage, ConnectionIndicator, LocalIdentity, Participant,
    Roster, RosterChange,
};
