//! Mesh Call - Mehrparteien-Calls im P2P-Mesh
//!
//! Ein leichtgewichtiger Relay vermittelt nur Signaling:
//! - WebSocket-Signaling mit Reconnect (`signaling`)
//! - Eine WebRTC-Verbindung pro Teilnehmerpaar (`peer`)
//! - Call-Lebenszyklus, Roster, Chat und Mute (`call_engine`)
//! - Konfiguration über Umgebungsvariablen (`config`)

pub mod call_engine;
pub mod config;
pub mod peer;
pub mod signaling;

#[cfg(test)]
mod testing;

pub use call_engine::{CallEngine, CallEngineError, CallEvent, LocalIdentity};
pub use config::{ClientConfig, ConfigError};
pub use signaling::{SignalMessage, SignalingClient, SignalingEvent};

/// Initialisiert das Logging
///
/// Ergänzt `RUST_LOG` um Standard-Direktiven; ein bereits installierter
/// Subscriber bleibt aktiv.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["mesh_call=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
