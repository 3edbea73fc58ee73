//! Signaling Module - Kontrollnachrichten über das Relay
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Relay:
//! - WebSocket-Verbindung aufbauen und halten
//! - Ausgehende Nachrichten stempeln und senden (nie puffern)
//! - Eingehende Nachrichten parsen und als Events weiterleiten
//!

mod channel;
mod messages;

pub use channel::{RelayChannel, SignalingChannel, SignalingError, SignalingEvent};
pub use messages::{CallEndReason, OutboundSignal, RelayMessage, Stamped};
