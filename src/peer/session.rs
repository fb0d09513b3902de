//! Media-Session Abstraktion und WebRTC-Implementierung
//!
//! Der Manager spricht nur mit [`MediaSession`]; die Produktions-Variante
//! kapselt eine `RTCPeerConnection` aus webrtc-rs. Callbacks der Connection
//! landen als [`SessionEvent`] in der Engine-Loop, markiert mit der
//! [`LinkId`] der Session.

use super::link::{LinkId, ProtocolError};
use crate::call_engine::SAMPLE_RATE;
use crate::signaling::Candidate;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Refusing to open a link to ourselves")]
    SelfLink,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

/// Transport-Zustand, wie ihn die Session meldet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    pub fn from_rtc(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::Connecting,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Eingehende Remote-Media eines Teilnehmers
#[derive(Clone)]
pub struct RemoteMedia {
    pub participant_id: String,
    pub stream_id: String,
    pub track_id: String,
    pub kind: MediaKind,
    /// Fehlt bei Test-Sessions
    pub track: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("participant_id", &self.participant_id)
            .field("stream_id", &self.stream_id)
            .field("track_id", &self.track_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum SessionEventKind {
    LocalCandidate(Candidate),
    Transport(TransportState),
    RemoteMedia(RemoteMedia),
}

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub link: LinkId,
    pub remote: String,
    pub kind: SessionEventKind,
}

/// Rückkanal einer Session in die Engine-Loop
#[derive(Debug, Clone)]
pub struct SessionNotifier {
    link: LinkId,
    remote: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionNotifier {
    pub fn new(link: LinkId, remote: String, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { link, remote, tx }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn local_candidate(&self, candidate: Candidate) {
        self.emit(SessionEventKind::LocalCandidate(candidate));
    }

    pub fn transport(&self, state: TransportState) {
        self.emit(SessionEventKind::Transport(state));
    }

    pub fn remote_media(&self, media: RemoteMedia) {
        self.emit(SessionEventKind::RemoteMedia(media));
    }

    fn emit(&self, kind: SessionEventKind) {
        // Engine beendet: Event verfällt
        let _ = self.tx.send(SessionEvent {
            link: self.link,
            remote: self.remote.clone(),
            kind,
        });
    }
}

// ============================================================================
// LOCAL TRACKS
// ============================================================================

/// Ausgehende Tracks, von allen Sessions gemeinsam genutzt
#[derive(Clone, Default)]
pub struct LocalTracks {
    pub audio: Option<Arc<TrackLocalStaticRTP>>,
    pub video: Option<Arc<TrackLocalStaticRTP>>,
}

impl LocalTracks {
    pub fn new(stream_id: &str, audio: bool, video: bool) -> Self {
        let audio = audio.then(|| {
            Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    clock_rate: SAMPLE_RATE,
                    channels: 1,
                    ..Default::default()
                },
                "audio".to_string(),
                stream_id.to_string(),
            ))
        });
        let video = video.then(|| {
            Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_string(),
                stream_id.to_string(),
            ))
        });

        Self { audio, video }
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

impl std::fmt::Debug for LocalTracks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTracks")
            .field("audio", &self.audio.is_some())
            .field("video", &self.video.is_some())
            .finish()
    }
}

// ============================================================================
// SESSION TRAITS
// ============================================================================

/// Eine Aushandlungs-Session zu genau einem Remote-Teilnehmer
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Erstellt ein Offer, setzt es lokal und gibt das SDP zurück
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Erstellt ein Answer, setzt es lokal und gibt das SDP zurück
    async fn create_answer(&self) -> Result<String, PeerError>;

    async fn apply_remote_offer(&self, sdp: &str) -> Result<(), PeerError>;

    async fn apply_remote_answer(&self, sdp: &str) -> Result<(), PeerError>;

    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), PeerError>;

    async fn close(&self);
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create_session(
        &self,
        notifier: SessionNotifier,
        tracks: &LocalTracks,
    ) -> Result<Arc<dyn MediaSession>, PeerError>;
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

/// Baut `RTCPeerConnection`s mit Default-Codecs und Interceptors
pub struct RtcSessionFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcSessionFactory {
    pub fn new(stun_urls: &[String]) -> Result<Self, PeerError> {
        // Media Engine mit Opus/VP8 konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_urls.to_vec(),
                ..Default::default()
            }]
        };

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }
}

#[async_trait]
impl SessionFactory for RtcSessionFactory {
    async fn create_session(
        &self,
        notifier: SessionNotifier,
        tracks: &LocalTracks,
    ) -> Result<Arc<dyn MediaSession>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?,
        );

        add_media(&pc, tracks.audio.as_ref(), RTPCodecType::Audio).await?;
        add_media(&pc, tracks.video.as_ref(), RTPCodecType::Video).await?;

        tracing::debug!(
            "Created peer connection {} for {}",
            notifier.link(),
            notifier.remote()
        );
        install_handlers(&pc, notifier);

        Ok(Arc::new(RtcSession { pc }))
    }
}

/// Lokalen Track senden oder nur empfangen
async fn add_media(
    pc: &RTCPeerConnection,
    track: Option<&Arc<TrackLocalStaticRTP>>,
    kind: RTPCodecType,
) -> Result<(), PeerError> {
    match track {
        Some(track) => {
            pc.add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        }
        None => {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        }
    }
    Ok(())
}

/// Registriert Event Handler für die Peer Connection
fn install_handlers(pc: &RTCPeerConnection, notifier: SessionNotifier) {
    // Connection State Handler
    let state_notifier = notifier.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!(
            "Peer connection state ({}): {:?}",
            state_notifier.remote(),
            s
        );
        state_notifier.transport(TransportState::from_rtc(s));
        Box::pin(async {})
    }));

    // ICE Candidate Handler
    let candidate_notifier = notifier.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) => candidate_notifier.local_candidate(Candidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                }),
                Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler (für eingehende Media)
    let track_notifier = notifier;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Video => MediaKind::Video,
            _ => MediaKind::Audio,
        };
        tracing::info!(
            "Received {:?} track from {}: {:?}",
            kind,
            track_notifier.remote(),
            track.codec()
        );
        track_notifier.remote_media(RemoteMedia {
            participant_id: track_notifier.remote().to_string(),
            stream_id: track.stream_id(),
            track_id: track.id(),
            kind,
            track: Some(track),
        });
        Box::pin(async {})
    }));
}

pub struct RtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for RtcSession {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        Ok(answer.sdp)
    }

    async fn apply_remote_offer(&self, sdp: &str) -> Result<(), PeerError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: &Candidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_state_mapping() {
        assert_eq!(
            TransportState::from_rtc(RTCPeerConnectionState::Connected),
            TransportState::Connected
        );
        assert_eq!(
            TransportState::from_rtc(RTCPeerConnectionState::New),
            TransportState::Connecting
        );
        assert_eq!(
            TransportState::from_rtc(RTCPeerConnectionState::Failed),
            TransportState::Failed
        );
    }

    #[test]
    fn test_local_tracks_follow_constraints() {
        let tracks = LocalTracks::new("mesh-alice", true, false);
        assert!(tracks.audio.is_some());
        assert!(tracks.video.is_none());
        assert!(LocalTracks::new("mesh-alice", false, false).is_empty());
    }

    #[tokio::test]
    async fn test_notifier_tags_events_with_link() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = SessionNotifier::new(LinkId(7), "bob".to_string(), tx);

        notifier.transport(TransportState::Connected);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.link, LinkId(7));
        assert_eq!(event.remote, "bob");
        assert!(matches!(
            event.kind,
            SessionEventKind::Transport(TransportState::Connected)
        ));
    }

    #[tokio::test]
    async fn test_rtc_offer_roundtrip() {
        let factory = RtcSessionFactory::new(&[]).unwrap();
        let tracks = LocalTracks::new("mesh-test", true, false);
        let (tx, _rx) = mpsc::unbounded_channel();

        let offerer = factory
            .create_session(SessionNotifier::new(LinkId(1), "b".to_string(), tx.clone()), &tracks)
            .await
            .unwrap();
        let answerer = factory
            .create_session(SessionNotifier::new(LinkId(2), "a".to_string(), tx), &tracks)
            .await
            .unwrap();

        let offer = offerer.create_offer().await.unwrap();
        assert!(offer.contains("m=audio"));
        answerer.apply_remote_offer(&offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        offerer.apply_remote_answer(&answer).await.unwrap();

        assert!(answerer.apply_remote_offer("garbage").await.is_err());

        offerer.close().await;
        answerer.close().await;
    }
}
