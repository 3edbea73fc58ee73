//! WebSocket Channel zum Relay
//!
//! Verwaltet die WebSocket-Verbindung zum Signaling-Relay:
//! - Verbindungsaufbau und Peer-ID-Zuweisung
//! - Nicht-blockierendes Senden (try_send; bei toter Verbindung wird
//!   verworfen statt gepuffert)
//! - Event-basierte Zustellung eingehender Nachrichten

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::messages::{CallEndReason, OutboundSignal, RelayMessage, Stamped};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("invalid relay url: {0}")]
    InvalidUrl(String),

    #[error("websocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not connected to relay")]
    NotConnected,

    #[error("failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom RelayChannel ausgelöst werden
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Verbindung zum Relay getrennt
    Disconnected,

    /// Das Relay hat uns eine Peer-ID zugewiesen
    AssignedId { peer_id: String },

    /// Eingehende Einladung
    IncomingInvite {
        caller_id: String,
        caller_name: Option<String>,
        sdp_offer: String,
        is_reconnect: bool,
    },

    /// Antwort auf unsere Einladung erhalten
    AnswerReceived {
        callee_name: Option<String>,
        sdp_answer: String,
    },

    /// Verbindungs-Kandidat erhalten
    CandidateReceived { candidate: String },

    /// Ende-Signal der Gegenstelle (oder des Relays) erhalten
    RemoteEnd { reason: Option<CallEndReason> },

    /// Fehler vom Relay
    RelayError { message: String },
}

// ============================================================================
// CHANNEL TRAIT
// ============================================================================

/// Ausgehende Signalisierungs-Seite, vom Call-Kern konsumiert
///
/// `send` blockiert nie. Ist das Relay nicht erreichbar, wird die
/// Nachricht verworfen und der Aufrufer informiert den Benutzer lokal;
/// gepuffert wird nichts.
pub trait SignalingChannel: Send + Sync {
    fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError>;

    fn is_connected(&self) -> bool;
}

// ============================================================================
// CHANNEL STATE
// ============================================================================

#[derive(Debug, Default)]
struct ChannelState {
    is_connected: bool,
    peer_id: Option<String>,
}

// ============================================================================
// RELAY CHANNEL
// ============================================================================

/// WebSocket Client für die Relay-Kommunikation
pub struct RelayChannel {
    url: Url,
    state: Arc<RwLock<ChannelState>>,
    tx: Arc<RwLock<Option<mpsc::Sender<String>>>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl RelayChannel {
    /// Erstellt einen neuen RelayChannel (noch unverbunden).
    pub fn new(relay_url: &str) -> Result<Self, SignalingError> {
        let url = Url::parse(relay_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        let (event_tx, _) = broadcast::channel(100);

        Ok(Self {
            url,
            state: Arc::new(RwLock::new(ChannelState::default())),
            tx: Arc::new(RwLock::new(None)),
            event_tx,
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Gibt die vom Relay zugewiesene Peer-ID zurück (falls verbunden)
    pub fn peer_id(&self) -> Option<String> {
        self.state.read().peer_id.clone()
    }

    /// Verbindet mit dem Relay und startet Read/Write-Tasks.
    pub async fn connect(&self) -> Result<(), SignalingError> {
        let ws_url = self.url.as_str().replacen("http", "ws", 1);

        tracing::info!("Connecting to relay: {}", ws_url);

        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        // Message-Sender erstellen
        let (tx, mut rx) = mpsc::channel::<String>(100);
        *self.tx.write() = Some(tx);

        // State aktualisieren
        self.state.write().is_connected = true;
        let _ = self.event_tx.send(SignalingEvent::Connected);

        // Read-Task starten
        let state_clone = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayMessage>(&text) {
                        Ok(relay_msg) => {
                            Self::handle_relay_message(relay_msg, &state_clone, &event_tx);
                        }
                        Err(e) => {
                            tracing::warn!("Unparseable relay message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Disconnect-Status setzen
            state_clone.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task starten
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
        });

        Ok(())
    }

    /// Verarbeitet eingehende Relay-Nachrichten.
    fn handle_relay_message(
        msg: RelayMessage,
        state: &Arc<RwLock<ChannelState>>,
        event_tx: &broadcast::Sender<SignalingEvent>,
    ) {
        match msg {
            RelayMessage::AssignedId { peer_id } => {
                tracing::info!("Relay assigned peer id: {}", peer_id);
                state.write().peer_id = Some(peer_id.clone());
                let _ = event_tx.send(SignalingEvent::AssignedId { peer_id });
            }

            RelayMessage::Invite {
                caller_id,
                caller_name,
                sdp_offer,
                is_reconnect,
            } => {
                let _ = event_tx.send(SignalingEvent::IncomingInvite {
                    caller_id,
                    caller_name,
                    sdp_offer,
                    is_reconnect: is_reconnect.unwrap_or(false),
                });
            }

            RelayMessage::Answer {
                callee_name,
                sdp_answer,
            } => {
                let _ = event_tx.send(SignalingEvent::AnswerReceived {
                    callee_name,
                    sdp_answer,
                });
            }

            RelayMessage::Candidate { candidate } => {
                let _ = event_tx.send(SignalingEvent::CandidateReceived { candidate });
            }

            RelayMessage::End { reason } => {
                let _ = event_tx.send(SignalingEvent::RemoteEnd { reason });
            }

            RelayMessage::Error { message } => {
                tracing::error!("Relay error: {}", message);
                let _ = event_tx.send(SignalingEvent::RelayError { message });
            }
        }
    }
}

impl SignalingChannel for RelayChannel {
    fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let tx_guard = self.tx.read();
        let tx = tx_guard.as_ref().ok_or(SignalingError::NotConnected)?;

        let msg_string = serde_json::to_string(&Stamped::new(signal))
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        // try_send ist non-blocking
        tx.try_send(msg_string)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }
}

impl std::fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayChannel")
            .field("url", &self.url.as_str())
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_without_connection_is_dropped() {
        let channel = RelayChannel::new("wss://relay.example/ws").unwrap();

        let result = channel.send(OutboundSignal::Candidate {
            candidate: "{}".to_string(),
            target_id: "peer-b".to_string(),
        });

        assert!(matches!(result, Err(SignalingError::NotConnected)));
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(matches!(
            RelayChannel::new("not a url"),
            Err(SignalingError::InvalidUrl(_))
        ));
    }
}
