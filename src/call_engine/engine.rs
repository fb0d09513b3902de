//! Call Engine
//!
//! Ein einziger tokio-Task besitzt Coordinator, Peer-Manager und lokale
//! Media. Er verarbeitet Signaling-Events, Session-Callbacks, Befehle der
//! Oberfläche und einen Timer strikt nacheinander, sodass Roster und Links
//! nie gegeneinander laufen.

use super::coordinator::{CallCoordinator, CallSnapshot, JoinOutcome, StartOutcome};
use super::roster::{ChatMessage, LocalIdentity, Participant};
use crate::config::CallConfig;
use crate::peer::{RemoteMedia, SessionEvent, SessionFactory};
use crate::signaling::{SignalSink, SignalingEvent};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallEngineError {
    #[error("Only elevated participants may {0}")]
    NotElevated(&'static str),

    #[error("No active call")]
    NoActiveCall,

    #[error("Not in a call")]
    NotInCall,

    #[error("Call engine stopped")]
    EngineStopped,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Events für die Oberfläche
#[derive(Debug, Clone)]
pub enum CallEvent {
    SignalingConnected,
    SignalingDisconnected,
    CallStarted {
        call_id: String,
        started_by: Option<String>,
    },
    CallEnded {
        call_id: String,
    },
    ParticipantJoined(Participant),
    ParticipantLeft {
        participant_id: String,
    },
    LinkStateChanged {
        participant_id: String,
        state: String,
    },
    RemoteMedia(RemoteMedia),
    ChatReceived(ChatMessage),
    DeviceUnavailable {
        reason: String,
    },
    MuteChanged {
        muted: bool,
    },
    MutedByModerator {
        by: String,
    },
}

// ============================================================================
// COMMANDS
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, CallEngineError>>;

enum Command {
    StartCall(Reply<StartOutcome>),
    JoinCall(Reply<JoinOutcome>),
    LeaveCall(Reply<()>),
    EndCall(Reply<()>),
    SetMuted(bool, Reply<()>),
    SetVideoEnabled(bool, Reply<()>),
    SendChat(String, Reply<Option<ChatMessage>>),
    MuteAll(Reply<bool>),
    RefreshRoster(Reply<bool>),
    Snapshot(Reply<CallSnapshot>),
    Shutdown(Reply<()>),
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Handle auf die Engine-Loop
pub struct CallEngine {
    command_tx: mpsc::Sender<Command>,
    event_tx: broadcast::Sender<CallEvent>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl CallEngine {
    /// Startet die Engine-Loop
    pub fn spawn(
        identity: LocalIdentity,
        config: CallConfig,
        factory: Arc<dyn SessionFactory>,
        sink: Arc<dyn SignalSink>,
        signals: broadcast::Receiver<SignalingEvent>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        let (command_tx, command_rx) = mpsc::channel(32);

        let tick_interval = config.tick_interval;
        let (coordinator, session_rx) =
            CallCoordinator::new(identity, config, factory, sink, event_tx.clone());

        let task = tokio::spawn(run_loop(
            coordinator,
            signals,
            session_rx,
            command_rx,
            tick_interval,
        ));

        Self {
            command_tx,
            event_tx,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }

    pub async fn start_call(&self) -> Result<StartOutcome, CallEngineError> {
        self.request(Command::StartCall).await
    }

    pub async fn join_call(&self) -> Result<JoinOutcome, CallEngineError> {
        self.request(Command::JoinCall).await
    }

    pub async fn leave_call(&self) -> Result<(), CallEngineError> {
        self.request(Command::LeaveCall).await
    }

    pub async fn end_call(&self) -> Result<(), CallEngineError> {
        self.request(Command::EndCall).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallEngineError> {
        self.request(|reply| Command::SetMuted(muted, reply)).await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallEngineError> {
        self.request(|reply| Command::SetVideoEnabled(enabled, reply))
            .await
    }

    /// `Ok(None)` wenn der Kanal die Nachricht nicht annehmen konnte
    pub async fn send_chat(&self, body: String) -> Result<Option<ChatMessage>, CallEngineError> {
        self.request(|reply| Command::SendChat(body, reply)).await
    }

    pub async fn mute_all(&self) -> Result<bool, CallEngineError> {
        self.request(Command::MuteAll).await
    }

    pub async fn refresh_roster(&self) -> Result<bool, CallEngineError> {
        self.request(Command::RefreshRoster).await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallEngineError> {
        self.request(Command::Snapshot).await
    }

    /// Verlässt einen laufenden Call und beendet die Loop
    pub async fn shutdown(&self) {
        if let Err(e) = self.request(Command::Shutdown).await {
            tracing::debug!("Engine already stopped: {}", e);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, CallEngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(make(reply_tx))
            .await
            .map_err(|_| CallEngineError::EngineStopped)?;
        reply_rx.await.map_err(|_| CallEngineError::EngineStopped)?
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("running", &!self.command_tx.is_closed())
            .finish()
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

async fn run_loop(
    mut coordinator: CallCoordinator,
    mut signals: broadcast::Receiver<SignalingEvent>,
    mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    mut command_rx: mpsc::Receiver<Command>,
    tick_interval: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut signals_open = true;

    tracing::info!(
        "Call engine running for {}",
        coordinator.identity().participant_id
    );

    loop {
        tokio::select! {
            signal = signals.recv(), if signals_open => match signal {
                Ok(SignalingEvent::Message(message)) => coordinator.handle_signal(message).await,
                Ok(SignalingEvent::Connected { reconnect }) => {
                    coordinator.on_signaling_connected(reconnect)
                }
                Ok(SignalingEvent::Disconnected) => coordinator.on_signaling_disconnected(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Nachrichten verpasst: Zustand vom Relay neu holen
                    tracing::warn!("Missed {} signaling events, resyncing", skipped);
                    coordinator.refresh_roster();
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::warn!("Signaling event stream closed");
                    signals_open = false;
                }
            },

            Some(event) = session_rx.recv() => {
                coordinator.handle_session_event(event).await;
            }

            command = command_rx.recv() => match command {
                Some(Command::Shutdown(reply)) => {
                    coordinator.shutdown().await;
                    let _ = reply.send(Ok(()));
                    break;
                }
                Some(command) => handle_command(&mut coordinator, command).await,
                None => {
                    coordinator.shutdown().await;
                    break;
                }
            },

            _ = ticker.tick() => {
                coordinator.tick(tokio::time::Instant::now()).await;
            }
        }
    }

    tracing::info!("Call engine stopped");
}

async fn handle_command(coordinator: &mut CallCoordinator, command: Command) {
    match command {
        Command::StartCall(reply) => {
            let _ = reply.send(coordinator.start_call().await);
        }
        Command::JoinCall(reply) => {
            let _ = reply.send(coordinator.join_call().await);
        }
        Command::LeaveCall(reply) => {
            let _ = reply.send(coordinator.leave_call().await);
        }
        Command::EndCall(reply) => {
            let _ = reply.send(coordinator.end_call().await);
        }
        Command::SetMuted(muted, reply) => {
            let _ = reply.send(coordinator.set_muted(muted));
        }
        Command::SetVideoEnabled(enabled, reply) => {
            let _ = reply.send(coordinator.set_video_enabled(enabled));
        }
        Command::SendChat(body, reply) => {
            let _ = reply.send(coordinator.send_chat(&body));
        }
        Command::MuteAll(reply) => {
            let _ = reply.send(coordinator.mute_all());
        }
        Command::RefreshRoster(reply) => {
            let _ = reply.send(Ok(coordinator.refresh_roster()));
        }
        Command::Snapshot(reply) => {
            let _ = reply.send(Ok(coordinator.snapshot()));
        }
        Command::Shutdown(reply) => {
            let _ = reply.send(Ok(()));
        }
    }
}
