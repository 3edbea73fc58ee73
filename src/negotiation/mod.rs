//! Negotiation Module - Peer-Verbindung und Offer/Answer-Austausch
//!
//! Dieses Modul kapselt das Peer-Verbindungs-Primitiv:
//! - Frische Engine pro Anruf-Versuch
//! - Offer/Answer erzeugen, Remote Descriptions anwenden
//! - Kandidaten-, Track- und Verbindungszustands-Signale
//!

mod engine;
mod webrtc;

pub use engine::{
    ConnectivityState, NegotiationEngine, NegotiationError, NegotiationEvent, NegotiationFactory,
};
pub use webrtc::{default_ice_servers, WebRtcNegotiation, WebRtcNegotiationFactory};
