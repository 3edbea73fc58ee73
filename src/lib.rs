//! Peercall - P2P Audio Call Session Core
//!
//! Zwei Clients bauen nach Vermittlung durch ein Relay eine direkte
//! Audio-Verbindung auf. Das Relay transportiert ausschließlich kleine
//! Kontrollnachrichten, nie Media. Kern des Crates ist die Call Session
//! State Machine:
//! - Offer/Answer/Candidate-Austausch über das Relay
//! - Höchstens ein aktiver Anruf, Besetzt-Abweisung für weitere
//! - 30s Auto-Reject für unbeantwortete Anrufe
//! - Begrenzte Reparatur bei transientem Verbindungsverlust
//! - Deterministisches Cleanup auf jedem Ausstiegspfad
//!
//! ## Verdrahtung
//! ```no_run
//! # async fn wire() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use peercall::{
//!     CallManager, CpalMediaProvider, NullNotifier, RelayChannel, SignalingChannel,
//!     WebRtcNegotiationFactory,
//! };
//!
//! let relay = Arc::new(RelayChannel::new("wss://relay.example/ws")?);
//! relay.connect().await?;
//!
//! let manager = CallManager::new(
//!     "my-peer-id".to_string(),
//!     "Alice".to_string(),
//!     Arc::new(CpalMediaProvider::new()),
//!     Arc::new(WebRtcNegotiationFactory::new()),
//!     Arc::clone(&relay) as Arc<dyn SignalingChannel>,
//!     Arc::new(NullNotifier),
//! );
//! manager.attach_signaling(relay.subscribe());
//!
//! manager.start_outgoing_call("other-peer-id").await?;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod media;
pub mod negotiation;
pub mod notify;
pub mod signaling;

pub use call::{
    format_duration, CallDirection, CallError, CallManager, CallSession, CallStatus, RemotePeer,
    SessionGeneration, MAX_RECONNECT_ATTEMPTS, RING_TIMEOUT_SECS,
};
pub use media::{CpalMediaProvider, LocalTrack, MediaError, MediaProvider};
pub use negotiation::{
    ConnectivityState, NegotiationEngine, NegotiationError, NegotiationEvent, NegotiationFactory,
    WebRtcNegotiationFactory,
};
pub use notify::{Notifier, NullNotifier};
pub use signaling::{
    CallEndReason, OutboundSignal, RelayChannel, SignalingChannel, SignalingError, SignalingEvent,
};

/// Initialisiert das Logging für Einbettungen ohne eigenes Setup.
///
/// Respektiert `RUST_LOG`; ohne Umgebungsvariable loggt das Crate auf
/// Debug und die WebRTC-Interna nur auf Warn.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("peercall=debug".parse().expect("static directive"))
                .add_directive("webrtc=warn".parse().expect("static directive")),
        )
        .init();
}
