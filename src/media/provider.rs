//! Media Provider - Beschaffung und Freigabe des lokalen Audio-Tracks
//!
//! Der Provider ist ein Blatt ohne Abhängigkeiten. Die Session besitzt
//! den gelieferten Track exklusiv und gibt ihn auf jedem terminalen Pfad
//! wieder frei.

use async_trait::async_trait;
use thiserror::Error;

use super::capture::CaptureTrack;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum MediaError {
    /// Zugriff auf das Aufnahmegerät wurde verweigert (vom Benutzer behebbar)
    #[error("audio capture permission denied")]
    PermissionDenied,

    /// Aufnahmegerät nicht verfügbar oder Konfiguration fehlgeschlagen
    #[error("audio device error: {0}")]
    DeviceError(String),
}

impl MediaError {
    /// Ordnet eine Backend-Fehlerbeschreibung der Taxonomie zu.
    ///
    /// cpal meldet verweigerte Berechtigungen plattformabhängig als
    /// Backend-Text, daher die Klassifikation über den Wortlaut.
    pub fn from_backend_description(description: &str) -> Self {
        let lower = description.to_lowercase();
        if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed")
        {
            MediaError::PermissionDenied
        } else {
            MediaError::DeviceError(description.to_string())
        }
    }
}

// ============================================================================
// LOCAL TRACK
// ============================================================================

/// Lokaler Audio-Track, exklusiv im Besitz der aktiven Session
pub trait LocalTrack: Send {
    /// Schaltet die Audio-Ausgabe des Tracks an/ab (Mute), ohne ihn freizugeben.
    fn set_enabled(&self, enabled: bool);

    /// Stoppt die Aufnahme und gibt das Gerät frei. Idempotent.
    fn release(&mut self);
}

// ============================================================================
// MEDIA PROVIDER
// ============================================================================

/// Beschafft den lokalen Audio-Track
#[async_trait]
pub trait MediaProvider: Send + Sync {
    /// Öffnet das Standard-Aufnahmegerät und startet die Capture.
    async fn acquire_audio(&self) -> Result<Box<dyn LocalTrack>, MediaError>;
}

/// Provider auf Basis von cpal (Standard-Eingabegerät des Systems)
#[derive(Debug, Default)]
pub struct CpalMediaProvider;

impl CpalMediaProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaProvider for CpalMediaProvider {
    async fn acquire_audio(&self) -> Result<Box<dyn LocalTrack>, MediaError> {
        // cpal blockiert beim Geräte-Setup, daher auf einen Blocking-Thread
        // ausweichen um den Event-Loop nicht anzuhalten.
        let track = tokio::task::spawn_blocking(CaptureTrack::open)
            .await
            .map_err(|e| MediaError::DeviceError(e.to_string()))??;

        Ok(Box::new(track))
    }
}

// ============================================================================
// TESTS
// ============================================================================
