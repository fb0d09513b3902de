//! Headless Mesh-Call Client
//!
//! Liest Befehle von stdin und gibt Call-Events auf stdout aus.

use anyhow::Context;
use mesh_call::call_engine::{CallEngine, CallEvent, StartOutcome};
use mesh_call::config::ClientConfig;
use mesh_call::peer::RtcSessionFactory;
use mesh_call::signaling::SignalingClient;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "/start /join /leave /end /mute /unmute /muteall /video on|off /who /quit, anything else is chat";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::from_env().context("invalid configuration")?;
    mesh_call::init_tracing();

    tracing::info!(
        "Starting as {} ({})",
        config.identity.display_name,
        config.identity.participant_id
    );

    let client = Arc::new(SignalingClient::new(
        config.signaling.clone(),
        config.identity.to_info(),
    ));
    // Vor dem Connect abonnieren, sonst geht das erste Connected verloren
    let signals = client.subscribe();

    let factory = Arc::new(
        RtcSessionFactory::new(&config.call.ice_servers).context("failed to set up WebRTC")?,
    );
    let engine = CallEngine::spawn(
        config.identity.clone(),
        config.call.clone(),
        factory,
        client.clone(),
        signals,
    );

    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Event printer lagged by {} events", n);
                }
                Err(_) => break,
            }
        }
    });

    client
        .connect()
        .await
        .with_context(|| format!("cannot reach relay at {}", config.signaling.server_url))?;
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(e) = run_command(&engine, line).await {
            println!("! {}", e);
        }
    }

    engine.shutdown().await;
    client.disconnect().await;
    Ok(())
}

async fn run_command(engine: &CallEngine, line: &str) -> anyhow::Result<()> {
    match line {
        "/start" => match engine.start_call().await? {
            StartOutcome::Started(join) => println!("* started call {} ({:?})", join.call_id, join.mode),
            StartOutcome::AlreadyActive { call_id } => println!("* call {} already running", call_id),
        },
        "/join" => {
            let join = engine.join_call().await?;
            println!("* joined call {} ({:?})", join.call_id, join.mode);
            if let Some(e) = join.device_error {
                println!("* joined without microphone: {}", e);
            }
        }
        "/leave" => engine.leave_call().await?,
        "/end" => engine.end_call().await?,
        "/mute" => engine.set_muted(true).await?,
        "/unmute" => engine.set_muted(false).await?,
        "/muteall" => {
            if !engine.mute_all().await? {
                println!("* mute-all not delivered, signaling offline");
            }
        }
        "/video on" => engine.set_video_enabled(true).await?,
        "/video off" => engine.set_video_enabled(false).await?,
        "/who" => {
            let snapshot = engine.snapshot().await?;
            match &snapshot.call {
                Some(call) => println!("* call {} ({:?})", call.id, call.lifecycle),
                None => println!("* no call"),
            }
            for p in &snapshot.participants {
                let link = snapshot
                    .links
                    .iter()
                    .find(|(id, _)| *id == p.id)
                    .map(|(_, state)| state.as_str())
                    .unwrap_or("-");
                println!(
                    "  {}{} [{}] {:?} link={}",
                    p.display_name,
                    if p.is_elevated { " (host)" } else { "" },
                    p.id,
                    p.connection,
                    if p.is_self { "self" } else { link }
                );
            }
            println!("  muted={} media={:?}", snapshot.muted, snapshot.media_mode);
        }
        _ if line.starts_with('/') => println!("{}", HELP),
        body => {
            if engine.send_chat(body.to_string()).await?.is_none() {
                println!("* message not sent");
            }
        }
    }
    Ok(())
}

fn print_event(event: &CallEvent) {
    match event {
        CallEvent::SignalingConnected => println!("* signaling connected"),
        CallEvent::SignalingDisconnected => println!("* signaling lost, reconnecting"),
        CallEvent::CallStarted { call_id, started_by } => match started_by {
            Some(by) => println!("* call {} started by {}", call_id, by),
            None => println!("* call {} in progress", call_id),
        },
        CallEvent::CallEnded { call_id } => println!("* call {} ended", call_id),
        CallEvent::ParticipantJoined(p) => println!("* {} joined", p.display_name),
        CallEvent::ParticipantLeft { participant_id } => println!("* {} left", participant_id),
        CallEvent::LinkStateChanged {
            participant_id,
            state,
        } => tracing::debug!("Link to {} is {}", participant_id, state),
        CallEvent::RemoteMedia(media) => {
            println!("* receiving {:?} from {}", media.kind, media.participant_id)
        }
        CallEvent::ChatReceived(chat) => println!("<{}> {}", chat.display_name, chat.body),
        CallEvent::DeviceUnavailable { reason } => println!("* microphone unavailable: {}", reason),
        CallEvent::MuteChanged { muted } => println!("* {}", if *muted { "muted" } else { "unmuted" }),
        CallEvent::MutedByModerator { by } => println!("* muted by {}", by),
    }
}
