//! Capture Track - Mikrofon-Aufnahme über cpal
//!
//! Nimmt Raw-PCM vom Standard-Eingabegerät in einen Ring-Buffer auf.
//! Resampling auf 48kHz passiert direkt im Capture-Callback, ebenso die
//! Mute-Prüfung und die RMS-Pegelmessung.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::Arc;

use super::provider::{LocalTrack, MediaError};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für den Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// CAPTURE TRACK
// ============================================================================

/// Lokaler Mikrofon-Track
///
/// Note: Stream ist nicht Send, daher wrappen wir in einen Send-fähigen
/// Container und halten den Stream in einer Option die bei release()
/// gedroppt wird.
pub struct CaptureTrack {
    stream: Option<Stream>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM, 48kHz mono)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Track aktiv? false == gemutet, Callback verwirft die Samples
    enabled: Arc<Mutex<bool>>,

    /// Eingangspegel (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,
}

// CaptureTrack ist nicht automatisch Send wegen Stream
unsafe impl Send for CaptureTrack {}

impl CaptureTrack {
    /// Öffnet das Standard-Eingabegerät und startet die Aufnahme.
    pub fn open() -> Result<Self, MediaError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| MediaError::DeviceError("no audio input device found".to_string()))?;

        let config = Self::find_best_config(&device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let enabled = Arc::new(Mutex::new(true));
        let input_level = Arc::new(Mutex::new(0.0f32));

        let buffer_clone = Arc::clone(&capture_buffer);
        let enabled_clone = Arc::clone(&enabled);
        let level_clone = Arc::clone(&input_level);
        let target_sample_rate = SAMPLE_RATE;
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Audio Level berechnen (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *level_clone.lock() = rms.min(1.0);

                    if !*enabled_clone.lock() {
                        return;
                    }

                    // Resampling falls nötig (zu 48kHz)
                    let samples: Vec<f32> = if source_sample_rate != target_sample_rate {
                        // Einfaches Linear-Resampling
                        let ratio = target_sample_rate as f32 / source_sample_rate as f32;
                        let new_len = (data.len() as f32 * ratio) as usize;
                        (0..new_len)
                            .map(|i| {
                                let src_idx = i as f32 / ratio;
                                let idx = src_idx as usize;
                                let frac = src_idx - idx as f32;
                                let s1 = data.get(idx).copied().unwrap_or(0.0);
                                let s2 = data.get(idx + 1).copied().unwrap_or(s1);
                                s1 + (s2 - s1) * frac
                            })
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    // In Ring-Buffer schreiben
                    let mut buffer = buffer_clone.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::from_backend_description(&e.to_string()))?;

        stream
            .play()
            .map_err(|e| MediaError::DeviceError(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            capture_buffer,
            enabled,
            input_level,
        })
    }

    /// Liest einen 20ms-Frame aufgenommenes Audio, falls genug vorliegt.
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    /// Gibt den aktuellen Eingangspegel zurück (0.0 - 1.0).
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }
}

impl LocalTrack for CaptureTrack {
    fn set_enabled(&self, enabled: bool) {
        *self.enabled.lock() = enabled;
        tracing::debug!("Capture track enabled: {}", enabled);
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            tracing::info!("Audio capture stopped");
        }
    }
}

impl Drop for CaptureTrack {
    fn drop(&mut self) {
        self.release();
    }
}

impl CaptureTrack {
    /// Findet die beste Input-Konfiguration (48kHz > andere, F32 bevorzugt).
    fn find_best_config(device: &Device) -> Result<StreamConfig, MediaError> {
        let configs: Vec<SupportedStreamConfigRange> = device
            .supported_input_configs()
            .map_err(|e| MediaError::from_backend_description(&e.to_string()))?
            .collect();

        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        // Versuche exakt 48kHz in F32 zu finden
        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        // Fallback auf beste verfügbare F32-Konfiguration
        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        // Nehme erste verfügbare Konfiguration
        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(MediaError::DeviceError(
            "no suitable audio configuration found".to_string(),
        ))
    }
}
