//! Call Session - Datenmodell des aktiven Anrufs
//!
//! Es existiert zu jedem Zeitpunkt höchstens eine Session. Der Wert lebt
//! als Feld im `CallManager` und ist im `Idle`-Zustand "leer" (alle
//! Felder auf Default). Jede neue Session und jeder Reset erzeugt eine
//! frische Generation, gegen die späte asynchrone Abschlüsse geprüft
//! werden.

use crate::media::LocalTrack;
use serde::Serialize;
use uuid::Uuid;

// ============================================================================
// STATUS & RICHTUNG
// ============================================================================

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Kein aktiver Anruf
    Idle,
    /// Ausgehender Anruf wird aufgebaut
    Calling,
    /// Eingehender Anruf wartet auf Antwort
    Ringing,
    /// Verbindung wird hergestellt
    Connecting,
    /// Anruf aktiv
    Connected,
    /// Anruf beendet (transient, kollabiert sofort nach dem Cleanup zu Idle)
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Calling => "calling",
            CallStatus::Ringing => "ringing",
            CallStatus::Connecting => "connecting",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
        }
    }
}

/// Richtung des Anrufs, wird einmalig bei Session-Erzeugung gesetzt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

// ============================================================================
// REMOTE PEER
// ============================================================================

/// Die Gegenstelle des Anrufs
///
/// `id` ist die vom Relay vergebene Peer-ID und unveränderlich.
/// `display_name` startet als Kopie der ID und darf genau einmal
/// aufgewertet werden, z.B. wenn der Name erst mit dem Answer eintrifft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    pub id: String,
    pub display_name: String,
}

impl RemotePeer {
    pub fn new(id: String, display_name: Option<String>) -> Self {
        let display_name = match display_name {
            Some(name) if !name.is_empty() => name,
            _ => id.clone(),
        };
        Self { id, display_name }
    }

    /// Wertet den Anzeigenamen auf, falls bisher nur die ID bekannt war.
    pub fn upgrade_display_name(&mut self, name: &str) {
        if !name.is_empty() && self.display_name == self.id {
            self.display_name = name.to_string();
        }
    }
}

// ============================================================================
// SESSION GENERATION
// ============================================================================

/// Identität einer Session-Inkarnation
///
/// Jede asynchrone Fortsetzung (Media-Acquisition, Offer/Answer, Timer)
/// merkt sich die Generation unter der sie gestartet wurde. Läuft das
/// Cleanup vorher, stimmt die Generation nicht mehr und der späte
/// Abschluss wird verworfen statt eine tote Session wiederzubeleben.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGeneration(Uuid);

impl SessionGeneration {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionGeneration {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Maximale Anzahl an Reconnect-Versuchen bevor der Anruf endgültig scheitert
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;

/// Zustand des (höchstens einen) aktiven Anrufs
///
/// Wird ausschließlich vom `CallManager` mutiert. Der lokale Track gehört
/// exklusiv der Session und wird auf jedem terminalen Pfad freigegeben.
pub struct CallSession {
    pub generation: SessionGeneration,
    pub status: CallStatus,
    pub direction: Option<CallDirection>,
    pub remote_peer: Option<RemotePeer>,
    pub local_track: Option<Box<dyn LocalTrack>>,
    /// Referenz-Marker: Remote-Media ist eingetroffen (nicht besessen)
    pub remote_track_attached: bool,
    /// Gespeichertes Remote-Offer zwischen `Ringing` und Annahme
    pub pending_remote_offer: Option<String>,
    /// Kandidaten die vor der Remote-Description eintrafen, in Ankunftsreihenfolge
    pub queued_remote_candidates: Vec<String>,
    /// Wurde bereits eine Remote-Description angewendet?
    pub remote_description_set: bool,
    pub is_muted: bool,
    pub reconnect_attempts: u32,
    pub duration_secs: u64,
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            generation: SessionGeneration::new(),
            status: CallStatus::Idle,
            direction: None,
            remote_peer: None,
            local_track: None,
            remote_track_attached: false,
            pending_remote_offer: None,
            queued_remote_candidates: Vec::new(),
            remote_description_set: false,
            is_muted: false,
            reconnect_attempts: 0,
            duration_secs: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == CallStatus::Idle
    }

    /// Beginnt eine ausgehende Session.
    pub fn begin_outgoing(&mut self, callee_id: String) {
        self.generation = SessionGeneration::new();
        self.status = CallStatus::Calling;
        self.direction = Some(CallDirection::Outgoing);
        self.remote_peer = Some(RemotePeer::new(callee_id, None));
    }

    /// Beginnt eine eingehende Session mit gespeichertem Offer.
    pub fn begin_incoming(&mut self, caller_id: String, caller_name: Option<String>, offer: String) {
        self.generation = SessionGeneration::new();
        self.status = CallStatus::Ringing;
        self.direction = Some(CallDirection::Incoming);
        self.remote_peer = Some(RemotePeer::new(caller_id, caller_name));
        self.pending_remote_offer = Some(offer);
    }

    /// Hängt einen Kandidaten an die Warteschlange an.
    pub fn queue_candidate(&mut self, candidate: String) {
        self.queued_remote_candidates.push(candidate);
    }

    /// Entnimmt alle gequeueten Kandidaten in Ankunftsreihenfolge.
    pub fn drain_candidates(&mut self) -> Vec<String> {
        std::mem::take(&mut self.queued_remote_candidates)
    }

    pub fn remote_display_name(&self) -> Option<&str> {
        self.remote_peer.as_ref().map(|p| p.display_name.as_str())
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_peer.as_ref().map(|p| p.id.as_str())
    }

    /// Setzt alle Felder auf die Idle-Defaults zurück und erzeugt eine
    /// frische Generation. Der lokale Track muss vorher entnommen und
    /// freigegeben worden sein.
    pub fn reset(&mut self) {
        debug_assert!(self.local_track.is_none(), "track must be released before reset");
        *self = Self::new();
    }
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("status", &self.status)
            .field("direction", &self.direction)
            .field("remote_peer", &self.remote_peer)
            .field("has_local_track", &self.local_track.is_some())
            .field("queued_candidates", &self.queued_remote_candidates.len())
            .field("is_muted", &self.is_muted)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("duration_secs", &self.duration_secs)
            .finish()
    }
}

// ============================================================================
// DURATION FORMATTING
// ============================================================================

/// Formatiert eine Gesprächsdauer als `m:ss`, z.B. 125 -> "2:05".
pub fn format_duration(seconds: u64) -> String {
    let minutes = seconds / 60;
    let remaining = seconds % 60;
    format!("{}:{:02}", minutes, remaining)
}

// ============================================================================
// TESTS
// ============================================================================
