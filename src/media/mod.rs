//! Media Module - Lokale Audio-Aufnahme
//!
//! Dieses Modul beschafft und verwaltet den lokalen Audio-Track:
//! - Mikrofon Capture über cpal (Standard-Eingabegerät)
//! - Mute-Schaltung ohne Freigabe des Geräts
//! - Deterministische Freigabe beim Session-Ende
//!

mod capture;
mod provider;

pub use capture::{CaptureTrack, CHANNELS, FRAME_SIZE, SAMPLE_RATE};
pub use provider::{CpalMediaProvider, LocalTrack, MediaError, MediaProvider};
