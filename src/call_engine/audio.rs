//! Mikrofon-Capture
//!
//! Der cpal-Stream ist nicht `Send` und lebt daher auf einem eigenen Thread.
//! Nach außen gehen nur der gemeinsame [`CaptureState`] mit Ring-Buffer,
//! Mute-Flag und Pegel. PCM wird auf 48kHz mono gebracht, das Encoding
//! übernimmt der Host.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

/// Ausgabe-Rate aller Frames
pub const SAMPLE_RATE: u32 = 48000;

pub const CHANNELS: u16 = 1;

/// 20ms bei 48kHz
pub const FRAME_SIZE: usize = 960;

/// 200ms Puffer, ältere Samples gehen verloren
const CAPTURE_CAPACITY: usize = FRAME_SIZE * 10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No microphone available")]
    NoInputDevice,

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Microphone configuration not supported: {0}")]
    UnsupportedConfig(String),

    #[error("Could not open capture stream: {0}")]
    StreamBuildError(String),

    #[error("Could not start capture stream: {0}")]
    StreamPlayError(String),
}

/// Zwischen Capture-Thread und Engine geteilter Zustand
struct CaptureState {
    samples: Mutex<HeapRb<f32>>,
    muted: AtomicBool,
    /// RMS des letzten Callbacks als f32-Bits
    level: AtomicU32,
}

impl CaptureState {
    fn new() -> Self {
        Self {
            samples: Mutex::new(HeapRb::new(CAPTURE_CAPACITY)),
            muted: AtomicBool::new(false),
            level: AtomicU32::new(0f32.to_bits()),
        }
    }

    /// Verarbeitet einen Block aus dem cpal-Callback
    fn ingest(&self, data: &[f32], channels: usize, source_rate: u32) {
        let mono = downmix(data, channels);
        self.level
            .store(rms(&mono).min(1.0).to_bits(), Ordering::Relaxed);

        if self.muted.load(Ordering::Relaxed) {
            return;
        }
        let resampled = resample_linear(&mono, source_rate, SAMPLE_RATE);
        self.samples.lock().push_slice(&resampled);
    }
}

/// Mikrofon-Capture auf dem Thread `audio-capture`
pub struct AudioHandler {
    state: Arc<CaptureState>,
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl AudioHandler {
    /// Öffnet das Standard-Mikrofon
    ///
    /// Blockiert, bis der Stream läuft oder der Thread einen Fehler meldet.
    pub fn start() -> Result<Self, MediaError> {
        let state = Arc::new(CaptureState::new());
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread_state = Arc::clone(&state);
        let thread = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || match open_input_stream(thread_state) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Hält den Stream, bis stop() oder Drop das Signal schickt
                    let _ = stop_rx.recv();
                    drop(stream);
                    tracing::info!("Microphone capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| MediaError::DeviceUnavailable(e.to_string()))?;

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(MediaError::DeviceUnavailable("capture thread died".to_string())));
        if let Err(e) = ready {
            let _ = thread.join();
            return Err(e);
        }

        tracing::info!("Microphone capture running ({} Hz mono frames)", SAMPLE_RATE);
        Ok(Self {
            state,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Nächster vollständiger Frame, `None` solange weniger als 20ms anliegen
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut samples = self.state.samples.lock();
        if samples.occupied_len() < FRAME_SIZE {
            return None;
        }
        let mut frame = vec![0.0; FRAME_SIZE];
        samples.pop_slice(&mut frame);
        Some(frame)
    }

    /// Stumm verwirft auch bereits gepufferte Samples
    pub fn set_muted(&self, muted: bool) {
        self.state.muted.store(muted, Ordering::Relaxed);
        if muted {
            self.state.samples.lock().clear();
        }
        tracing::debug!("Capture muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.state.muted.load(Ordering::Relaxed)
    }

    /// Eingangspegel 0.0 - 1.0
    pub fn level(&self) -> f32 {
        f32::from_bits(self.state.level.load(Ordering::Relaxed))
    }
}

impl Drop for AudioHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioHandler")
            .field("muted", &self.is_muted())
            .field("level", &self.level())
            .finish()
    }
}

/// Muss auf dem Thread laufen, der den Stream danach hält
fn open_input_stream(state: Arc<CaptureState>) -> Result<cpal::Stream, MediaError> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or(MediaError::NoInputDevice)?;

    let ranges: Vec<SupportedStreamConfigRange> = device
        .supported_input_configs()
        .map_err(|e| MediaError::UnsupportedConfig(e.to_string()))?
        .collect();
    let config = select_best_config(&ranges)?;

    let source_rate = config.sample_rate.0;
    let channels = usize::from(config.channels);
    tracing::info!(
        "Opening {} ({} Hz, {} ch)",
        device.name().unwrap_or_else(|_| "input device".to_string()),
        source_rate,
        channels
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                state.ingest(data, channels, source_rate)
            },
            |err| tracing::error!("Microphone stream error: {}", err),
            None,
        )
        .map_err(|e| MediaError::StreamBuildError(e.to_string()))?;
    stream
        .play()
        .map_err(|e| MediaError::StreamPlayError(e.to_string()))?;

    Ok(stream)
}

// ============================================================================
// DSP
// ============================================================================

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum();
    (energy / samples.len() as f32).sqrt()
}

/// Interleaved Mehrkanal zu Mono (Mittelwert je Frame)
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Lineare Interpolation zwischen Nachbar-Samples
pub fn resample_linear(data: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || source_rate == 0 || data.is_empty() {
        return data.to_vec();
    }

    let step = source_rate as f64 / target_rate as f64;
    let out_len = (data.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    let last = data.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let left = (pos.floor() as usize).min(last);
            let right = (left + 1).min(last);
            let t = (pos - left as f64) as f32;
            data[left] + (data[right] - data[left]) * t
        })
        .collect()
}

/// f32 mit 48kHz bevorzugt, sonst die höchste f32-Rate
fn select_best_config(ranges: &[SupportedStreamConfigRange]) -> Result<StreamConfig, MediaError> {
    let target = cpal::SampleRate(SAMPLE_RATE);
    let float_ranges = || ranges.iter().filter(|r| r.sample_format() == SampleFormat::F32);

    let chosen = float_ranges()
        .find(|r| (r.min_sample_rate()..=r.max_sample_rate()).contains(&target))
        .map(|r| r.clone().with_sample_rate(target))
        .or_else(|| {
            float_ranges()
                .max_by_key(|r| r.max_sample_rate().0)
                .map(|r| r.clone().with_max_sample_rate())
        });

    chosen
        .map(|c| c.config())
        .ok_or_else(|| MediaError::UnsupportedConfig("microphone offers no f32 format".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{SampleRate, SupportedBufferSize};

    fn range(min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            1,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert!((rms(&[0.5, -0.5, 0.5, -0.5]) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_resample_doubles_length() {
        let out = resample_linear(&[0.0, 1.0, 0.0, 1.0], 24000, 48000);
        assert_eq!(out.len(), 8);
        assert!((out[1] - 0.5).abs() < 1e-6);

        let same = resample_linear(&[0.1, 0.2], SAMPLE_RATE, SAMPLE_RATE);
        assert_eq!(same, vec![0.1, 0.2]);
    }

    #[test]
    fn test_muted_capture_only_meters() {
        let state = CaptureState::new();
        state.ingest(&[0.5; FRAME_SIZE], 1, SAMPLE_RATE);
        assert_eq!(state.samples.lock().occupied_len(), FRAME_SIZE);

        state.muted.store(true, Ordering::Relaxed);
        state.ingest(&[0.25; FRAME_SIZE], 1, SAMPLE_RATE);
        assert_eq!(state.samples.lock().occupied_len(), FRAME_SIZE);
        assert!((f32::from_bits(state.level.load(Ordering::Relaxed)) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_downmix_stereo() {
        assert_eq!(downmix(&[1.0, 0.0, 0.5, 0.5], 2), vec![0.5, 0.5]);
    }

    #[test]
    fn test_select_prefers_48k_f32() {
        let config = select_best_config(&[
            range(8000, 16000, SampleFormat::I16),
            range(8000, 96000, SampleFormat::F32),
        ])
        .unwrap();
        assert_eq!(config.sample_rate.0, SAMPLE_RATE);

        let fallback = select_best_config(&[
            range(8000, 22050, SampleFormat::F32),
            range(8000, 44100, SampleFormat::F32),
        ])
        .unwrap();
        assert_eq!(fallback.sample_rate.0, 44100);

        assert!(matches!(
            select_best_config(&[range(8000, 48000, SampleFormat::I16)]),
            Err(MediaError::UnsupportedConfig(_))
        ));
    }
}
