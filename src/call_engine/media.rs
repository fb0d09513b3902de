//! Lokale Media eines Calls: Capture, Tracks und Mute-Zustand
//!
//! Mute und Video-Toggle schalten nur Flags um; bestehende Links werden dabei
//! nicht neu ausgehandelt.

use super::audio::{AudioHandler, MediaError};
use crate::peer::LocalTracks;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

/// Gewünschte lokale Media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    /// Nur zuschauen, kein Gerät öffnen
    pub fn none() -> Self {
        Self {
            audio: false,
            video: false,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaMode {
    Full,
    AudioOnly,
    VideoOnly,
    ObserveOnly,
}

pub struct LocalMedia {
    capture: Option<AudioHandler>,
    tracks: LocalTracks,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    speaking_threshold: f32,
    degradation: Option<MediaError>,
}

impl LocalMedia {
    /// Öffnet die angeforderten Geräte
    ///
    /// Schlägt das Mikrofon fehl, gibt es trotzdem eine nutzbare Instanz im
    /// reduzierten Modus; der Grund steht in [`LocalMedia::degradation`].
    pub async fn acquire(constraints: MediaConstraints, speaking_threshold: f32) -> Self {
        let (capture, degradation) = if constraints.audio {
            match tokio::task::spawn_blocking(AudioHandler::start).await {
                Ok(Ok(handler)) => (Some(handler), None),
                Ok(Err(e)) => {
                    tracing::warn!("Microphone unavailable, joining without audio: {}", e);
                    (None, Some(MediaError::DeviceUnavailable(e.to_string())))
                }
                Err(e) => {
                    tracing::error!("Audio start task failed: {}", e);
                    (None, Some(MediaError::DeviceUnavailable(e.to_string())))
                }
            }
        } else {
            (None, None)
        };

        let stream_id = format!("mesh-{}", uuid::Uuid::new_v4());
        let tracks = LocalTracks::new(&stream_id, capture.is_some(), constraints.video);

        let media = Self {
            capture,
            tracks,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(constraints.video),
            speaking_threshold,
            degradation,
        };
        tracing::info!("Local media ready: {:?}", media.mode());
        media
    }

    /// Ohne jedes Gerät
    pub fn observe_only(speaking_threshold: f32) -> Self {
        Self {
            capture: None,
            tracks: LocalTracks::default(),
            audio_enabled: AtomicBool::new(false),
            video_enabled: AtomicBool::new(false),
            speaking_threshold,
            degradation: None,
        }
    }

    pub fn mode(&self) -> MediaMode {
        match (self.tracks.audio.is_some(), self.tracks.video.is_some()) {
            (true, true) => MediaMode::Full,
            (true, false) => MediaMode::AudioOnly,
            (false, true) => MediaMode::VideoOnly,
            (false, false) => MediaMode::ObserveOnly,
        }
    }

    pub fn degradation(&self) -> Option<&MediaError> {
        self.degradation.as_ref()
    }

    pub fn tracks(&self) -> &LocalTracks {
        &self.tracks
    }

    /// Track, in den der Host encodierte Audio-Pakete schreibt
    pub fn audio_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.tracks.audio.clone()
    }

    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.tracks.video.clone()
    }

    pub fn set_muted(&self, muted: bool) {
        self.audio_enabled.store(!muted, Ordering::SeqCst);
        if let Some(capture) = &self.capture {
            capture.set_muted(muted);
        }
    }

    pub fn is_muted(&self) -> bool {
        !self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.video_enabled
            .store(enabled && self.tracks.video.is_some(), Ordering::SeqCst);
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    /// Nächster 20ms PCM-Frame zum Encodieren, `None` wenn stumm
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        if self.is_muted() {
            return None;
        }
        self.capture.as_ref().and_then(|c| c.read_frame())
    }

    pub fn level(&self) -> f32 {
        if self.is_muted() {
            return 0.0;
        }
        self.capture.as_ref().map(|c| c.level()).unwrap_or(0.0)
    }

    pub fn is_speaking(&self) -> bool {
        self.level() >= self.speaking_threshold && self.level() > 0.0
    }

    /// Gibt die Geräte frei
    pub fn release(mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        tracing::info!("Local media released");
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("mode", &self.mode())
            .field("muted", &self.is_muted())
            .field("video_enabled", &self.is_video_enabled())
            .field("degradation", &self.degradation)
            .finish()
    }
}
