//! Peer Connection Modul
//!
//! Ein Link pro Remote-Teilnehmer:
//! - Zustandsmaschine und Link-Inkarnationen (`link`)
//! - Aushandlung, Glare und Candidate-Puffer (`manager`)
//! - WebRTC-Sessions hinter dem [`MediaSession`]-Trait (`session`)

mod link;
mod manager;
mod session;

pub use link::{LinkEvent, LinkId, LinkState, PeerLink, ProtocolError, Role};
pub use manager::PeerConnectionManager;
pub use session::{
    LocalTracks, MediaKind, MediaSession, PeerError, RemoteMedia, RtcSession, RtcSessionFactory,
    SessionEvent, SessionEventKind, SessionFactory, SessionNotifier, TransportState,
};
