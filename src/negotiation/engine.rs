//! Negotiation Engine - Schnittstelle zum Peer-Verbindungs-Primitiv
//!
//! Pro Anruf-Versuch wird eine frische Engine erzeugt. Sie kapselt den
//! Offer/Answer/Candidate-Austausch und meldet drei asynchrone Signale
//! an die State Machine: lokal entdeckte Kandidaten, eintreffendes
//! Remote-Audio und Änderungen des Verbindungszustands.
//!
//! Die Engine kennt die Session nicht. Wird sie mitten in einer Operation
//! verworfen, läuft der späte Abschluss in den Generations-Check des
//! Managers und wird dort verworfen.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum NegotiationError {
    #[error("peer connection error: {0}")]
    Peer(String),

    #[error("invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
}

// ============================================================================
// CONNECTIVITY STATE
// ============================================================================

/// Low-level Verbindungszustand des Peer-Links
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    /// Direktverbindung steht
    Connected,
    /// Transient getrennt, Reparatur lohnt sich
    Disconnected,
    /// Endgültig gescheitert
    Failed,
    /// Lokal geschlossen (Cleanup läuft bereits)
    Closed,
}

// ============================================================================
// NEGOTIATION EVENTS
// ============================================================================

/// Asynchrone Signale der Engine an die State Machine
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    /// Lokal entdeckter Kandidat (JSON-kodiert), muss zum Peer signalisiert werden
    LocalCandidate(String),

    /// Remote-Audio-Track ist eingetroffen
    RemoteTrack,

    /// Verbindungszustand hat sich geändert
    Connectivity(ConnectivityState),
}

// ============================================================================
// ENGINE TRAIT
// ============================================================================

/// Dünner Adapter über dem Peer-Verbindungs-Primitiv
#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    /// Gibt einen Event-Receiver zurück
    fn subscribe(&self) -> broadcast::Receiver<NegotiationEvent>;

    /// Hängt den lokalen Audio-Track an die Verbindung an.
    async fn add_local_audio(&self) -> Result<(), NegotiationError>;

    /// Erstellt ein SDP Offer und setzt es als Local Description.
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    /// Erstellt ein SDP Answer und setzt es als Local Description.
    async fn create_answer(&self) -> Result<String, NegotiationError>;

    /// Wendet ein Remote-Offer als Remote Description an.
    async fn apply_remote_offer(&self, sdp: &str) -> Result<(), NegotiationError>;

    /// Wendet ein Remote-Answer als Remote Description an.
    async fn apply_remote_answer(&self, sdp: &str) -> Result<(), NegotiationError>;

    /// Fügt einen Remote-Kandidaten hinzu (JSON-kodiert).
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError>;

    /// Schließt die Verbindung. Weitere Events dürfen ignoriert werden.
    async fn close(&self);
}

/// Erzeugt pro Anruf-Versuch eine frische Engine
#[async_trait]
pub trait NegotiationFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn NegotiationEngine>, NegotiationError>;
}
