//! Signaling Module - WebSocket Client für den Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Relay:
//! - WebSocket-Verbindung aufbauen, halten und automatisch neu aufbauen
//! - Identität bei jedem Connect ankündigen
//! - Nachrichten fire-and-forget senden
//! - Eingehende Nachrichten parsen und als Events weiterleiten
//!

mod client;
mod messages;

pub use client::{
    backoff_delay, websocket_url, ConnectionStatus, SignalSink, SignalingClient, SignalingError,
    SignalingEvent,
};
pub use messages::*;
