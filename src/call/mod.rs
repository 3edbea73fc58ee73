//! Call Module - Session-Datenmodell und State Machine
//!
//! Dieses Modul ist der Kern des Crates:
//! - `CallSession`: der Zustand des (höchstens einen) aktiven Anrufs
//! - `CallManager`: die State Machine über Media, Negotiation und Signaling
//! - Ring-Timeout, Gesprächsdauer-Timer, begrenzte Reconnect-Reparatur
//!

mod manager;
mod session;

pub use manager::{CallError, CallManager, RING_TIMEOUT_SECS};
pub use session::{
    format_duration, CallDirection, CallSession, CallStatus, RemotePeer, SessionGeneration,
    MAX_RECONNECT_ATTEMPTS,
};
