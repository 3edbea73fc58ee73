//! Message Types für das Relay-Protokoll
//!
//! Das Relay leitet kleine Kontrollnachrichten zwischen den Peers weiter,
//! transportiert aber nie Media. Ausgehende Nachrichten werden beim Senden
//! in einen Zeitstempel-Umschlag gepackt; eingehende Nachrichten kommen
//! `type`-getaggt vom Relay zurück.

use serde::{Deserialize, Serialize};

// ============================================================================
// END REASONS
// ============================================================================

/// Grund für das Ende eines Anrufs, läuft beidseitig über die Leitung
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEndReason {
    /// Regulär aufgelegt
    Ended,
    /// Eingehender Anruf abgelehnt (auch: Ring-Timeout)
    Rejected,
    /// Gegenstelle telefoniert bereits
    Busy,
    /// Gegenstelle hat die Verbindung zum Relay verloren
    UserDisconnected,
}

impl CallEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallEndReason::Ended => "ended",
            CallEndReason::Rejected => "rejected",
            CallEndReason::Busy => "busy",
            CallEndReason::UserDisconnected => "user_disconnected",
        }
    }
}

// ============================================================================
// CLIENT → RELAY MESSAGES
// ============================================================================

/// Ausgehende Kontrollnachricht an das Relay
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundSignal {
    /// Einladung an den Angerufenen
    Invite {
        #[serde(rename = "calleeId")]
        callee_id: String,
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
        #[serde(rename = "callerName")]
        caller_name: String,
        #[serde(rename = "isReconnect", skip_serializing_if = "Option::is_none")]
        is_reconnect: Option<bool>,
    },

    /// Antwort des Angerufenen an den Anrufer
    Answer {
        #[serde(rename = "callerId")]
        caller_id: String,
        #[serde(rename = "sdpAnswer")]
        sdp_answer: String,
        #[serde(rename = "calleeName")]
        callee_name: String,
    },

    /// Verbindungs-Kandidat, in beide Richtungen
    Candidate {
        candidate: String,
        #[serde(rename = "targetId")]
        target_id: String,
    },

    /// Ende-Signal, in beide Richtungen
    End {
        #[serde(rename = "targetId")]
        target_id: String,
        reason: CallEndReason,
    },
}

/// Zeitstempel-Umschlag für ausgehende Nachrichten
#[derive(Debug, Clone, Serialize)]
pub struct Stamped<T: Serialize> {
    #[serde(flatten)]
    pub payload: T,
    pub timestamp: i64,
}

impl<T: Serialize> Stamped<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

// ============================================================================
// RELAY → CLIENT MESSAGES
// ============================================================================

/// Alle möglichen Relay-Nachrichten
///
/// Unbekannte Zusatzfelder (z.B. Relay-Zeitstempel) werden beim
/// Deserialisieren ignoriert.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    /// Das Relay hat dieser Verbindung eine Peer-ID zugewiesen
    AssignedId {
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// Eingehende Einladung
    Invite {
        #[serde(rename = "callerId")]
        caller_id: String,
        #[serde(rename = "callerName", default)]
        caller_name: Option<String>,
        #[serde(rename = "sdpOffer")]
        sdp_offer: String,
        #[serde(rename = "isReconnect", default)]
        is_reconnect: Option<bool>,
    },

    /// Eingehende Antwort auf unsere Einladung
    Answer {
        #[serde(rename = "calleeName", default)]
        callee_name: Option<String>,
        #[serde(rename = "sdpAnswer")]
        sdp_answer: String,
    },

    /// Eingehender Verbindungs-Kandidat
    Candidate { candidate: String },

    /// Gegenstelle (oder das Relay bei Disconnect) beendet den Anruf
    End {
        #[serde(default)]
        reason: Option<CallEndReason>,
    },

    /// Fehler vom Relay
    Error { message: String },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invite_wire_shape() {
        let signal = OutboundSignal::Invite {
            callee_id: "peer-b".to_string(),
            sdp_offer: "v=0...".to_string(),
            caller_name: "Alice".to_string(),
            is_reconnect: None,
        };

        let json = serde_json::to_value(Stamped::new(signal)).unwrap();
        assert_eq!(json["type"], "invite");
        assert_eq!(json["calleeId"], "peer-b");
        assert_eq!(json["callerName"], "Alice");
        // isReconnect wird ohne Wert gar nicht serialisiert
        assert!(json.get("isReconnect").is_none());
        assert!(json["timestamp"].is_i64());
    }

    #[test]
    fn test_end_reason_wire_values() {
        let signal = OutboundSignal::End {
            target_id: "peer-a".to_string(),
            reason: CallEndReason::UserDisconnected,
        };

        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], "end");
        assert_eq!(json["targetId"], "peer-a");
        assert_eq!(json["reason"], "user_disconnected");
    }

    #[test]
    fn test_relay_invite_parses_with_extra_fields() {
        let text = r#"{
            "type": "invite",
            "callerId": "peer-a",
            "callerName": "Alice",
            "sdpOffer": "v=0...",
            "timestamp": 1718000000000
        }"#;

        let msg: RelayMessage = serde_json::from_str(text).unwrap();
        match msg {
            RelayMessage::Invite {
                caller_id,
                caller_name,
                is_reconnect,
                ..
            } => {
                assert_eq!(caller_id, "peer-a");
                assert_eq!(caller_name.as_deref(), Some("Alice"));
                assert!(is_reconnect.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_relay_end_without_reason() {
        let msg: RelayMessage = serde_json::from_str(r#"{"type": "end"}"#).unwrap();
        match msg {
            RelayMessage::End { reason } => assert!(reason.is_none()),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
