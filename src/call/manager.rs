//! Call Manager - Die Session State Machine
//!
//! Besitzt die (höchstens eine) `CallSession` und orchestriert Media
//! Provider, Negotiation Engine und Signaling Channel. Alle Übergänge
//! laufen hier zusammen: lokale Benutzeraktionen, Remote-Signalisierung,
//! Media-Acquisition und Verbindungszustands-Events.
//!
//! Jeder terminale Pfad läuft durch `cleanup`: Timer weg, Track
//! freigegeben, Engine verworfen, Session auf Idle-Defaults. Späte
//! asynchrone Abschlüsse prüfen die Session-Generation und verwerfen
//! sich selbst, wenn die Session inzwischen abgeräumt wurde.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::media::{MediaError, MediaProvider};
use crate::negotiation::{
    ConnectivityState, NegotiationEngine, NegotiationError, NegotiationEvent, NegotiationFactory,
};
use crate::notify::Notifier;
use crate::signaling::{
    CallEndReason, OutboundSignal, SignalingChannel, SignalingError, SignalingEvent,
};

use super::session::{
    format_duration, CallDirection, CallSession, CallStatus, SessionGeneration,
    MAX_RECONNECT_ATTEMPTS,
};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Unbeantwortete eingehende Anrufe werden nach dieser Zeit abgewiesen
pub const RING_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("already in a call")]
    AlreadyInCall,

    #[error("cannot call yourself")]
    SelfCallRejected,

    #[error("no active call")]
    NoActiveCall,

    #[error("no incoming call to accept")]
    NoPendingInvitation,

    /// Die Session wurde während einer asynchronen Operation abgeräumt
    #[error("session superseded")]
    SessionSuperseded,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

// ============================================================================
// TIMER HANDLES
// ============================================================================

/// Abbrechbare Hintergrund-Tasks der aktiven Session
#[derive(Default)]
struct Timers {
    ring_timeout: Option<JoinHandle<()>>,
    duration_tick: Option<JoinHandle<()>>,
    event_pump: Option<JoinHandle<()>>,
}

// ============================================================================
// CALL MANAGER
// ============================================================================

/// State Machine über der einen aktiven `CallSession`
///
/// Wird als `Arc<CallManager>` gehalten; die Hintergrund-Tasks (Timer,
/// Event-Pump) klonen das Arc. Die eigene Peer-ID kommt vom Relay und
/// steht bei Konstruktion bereits fest.
pub struct CallManager {
    /// Selbst-Referenz für Hintergrund-Tasks; hält den Manager nicht am Leben
    me: Weak<CallManager>,
    local_id: String,
    local_name: String,
    session: Mutex<CallSession>,
    engine: Mutex<Option<Arc<dyn NegotiationEngine>>>,
    timers: Mutex<Timers>,
    media: Arc<dyn MediaProvider>,
    negotiation: Arc<dyn NegotiationFactory>,
    signaling: Arc<dyn SignalingChannel>,
    notifier: Arc<dyn Notifier>,
}

impl CallManager {
    /// Erstellt einen neuen CallManager im Idle-Zustand.
    pub fn new(
        local_id: String,
        local_name: String,
        media: Arc<dyn MediaProvider>,
        negotiation: Arc<dyn NegotiationFactory>,
        signaling: Arc<dyn SignalingChannel>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            local_id,
            local_name,
            session: Mutex::new(CallSession::new()),
            engine: Mutex::new(None),
            timers: Mutex::new(Timers::default()),
            media,
            negotiation,
            signaling,
            notifier,
        })
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn status(&self) -> CallStatus {
        self.session.lock().status
    }

    /// Gibt den Mute-Status zurück
    pub fn is_muted(&self) -> bool {
        self.session.lock().is_muted
    }

    /// Gibt die bisherige Gesprächsdauer in Sekunden zurück
    pub fn duration_secs(&self) -> u64 {
        self.session.lock().duration_secs
    }

    /// Verbindet den Manager mit den Events des Signaling-Kanals.
    ///
    /// Nicht-Call-Events (Registrierung, Relay-Fehler) gehen den Kern
    /// nichts an und werden hier ignoriert.
    pub fn attach_signaling(
        &self,
        mut events: broadcast::Receiver<SignalingEvent>,
    ) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(manager) = me.upgrade() else { break };
                        manager.handle_signal(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Signaling event stream lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Leitet ein Signaling-Event an die passende Operation weiter.
    async fn handle_signal(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingInvite {
                caller_id,
                caller_name,
                sdp_offer,
                is_reconnect,
            } => {
                self.handle_incoming_invitation(caller_id, sdp_offer, caller_name, is_reconnect)
                    .await;
            }

            SignalingEvent::AnswerReceived {
                callee_name,
                sdp_answer,
            } => {
                self.handle_call_answered(&sdp_answer, callee_name.as_deref())
                    .await;
            }

            SignalingEvent::CandidateReceived { candidate } => {
                self.handle_remote_candidate(&candidate).await;
            }

            SignalingEvent::RemoteEnd { reason } => {
                self.handle_remote_end(reason);
            }

            SignalingEvent::Disconnected => {
                // Relay weg: laufende P2P-Media läuft weiter, nur neue
                // Signalisierung scheitert (und wird lokal gemeldet)
                tracing::warn!("Signaling channel disconnected");
            }

            SignalingEvent::Connected
            | SignalingEvent::AssignedId { .. }
            | SignalingEvent::RelayError { .. } => {}
        }
    }

    // ========================================================================
    // OUTGOING CALLS
    // ========================================================================

    /// Startet einen ausgehenden Anruf.
    pub async fn start_outgoing_call(&self, target_id: &str) -> Result<(), CallError> {
        let generation = {
            let mut session = self.session.lock();
            if !session.is_idle() {
                drop(session);
                self.notifier.show(
                    "You're already in a call. End the current call before starting a new one.",
                );
                return Err(CallError::AlreadyInCall);
            }
            if target_id == self.local_id {
                drop(session);
                self.notifier.show("You cannot call yourself.");
                return Err(CallError::SelfCallRejected);
            }

            session.begin_outgoing(target_id.to_string());
            session.generation
        };

        tracing::info!("Starting call to {}", target_id);
        self.emit_status(CallStatus::Calling);
        self.notifier.show(&format!("Calling user {}...", target_id));

        // Lokales Audio beschaffen
        let track = match self.media.acquire_audio().await {
            Ok(track) => track,
            Err(e) => {
                tracing::error!("Error accessing microphone: {}", e);
                if self.generation_matches(generation) {
                    self.notifier.show(media_error_text(&e, false));
                    self.cleanup(false);
                }
                return Err(e.into());
            }
        };

        {
            let mut session = self.session.lock();
            if session.generation != generation {
                // Session wurde inzwischen abgeräumt, Gerät wieder freigeben
                drop(session);
                let mut track = track;
                track.release();
                return Err(CallError::SessionSuperseded);
            }
            session.local_track = Some(track);
        }

        // Engine aufbauen und Offer erstellen
        let engine = match self.create_engine(generation).await {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!("Error creating offer: {}", e);
                self.fail_attempt(generation, "Failed to start call. Please try again.");
                return Err(e);
            }
        };

        let offer = match engine.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::error!("Error creating offer: {}", e);
                self.fail_attempt(generation, "Failed to start call. Please try again.");
                return Err(e.into());
            }
        };

        if !self.generation_matches(generation) {
            return Err(CallError::SessionSuperseded);
        }

        // Einladung über das Relay schicken
        if let Err(e) = self.signaling.send(OutboundSignal::Invite {
            callee_id: target_id.to_string(),
            sdp_offer: offer,
            caller_name: self.local_name.clone(),
            is_reconnect: None,
        }) {
            tracing::warn!("Failed to send invite: {}", e);
            self.fail_attempt(generation, "Failed to start call. Please try again.");
            return Err(e.into());
        }

        Ok(())
    }

    /// Verarbeitet das Answer des Angerufenen. Der Übergang nach
    /// `Connected` kommt anschließend über das Verbindungszustands-Event,
    /// nicht aus diesem Aufruf.
    pub async fn handle_call_answered(&self, sdp_answer: &str, callee_name: Option<&str>) {
        let generation = {
            let mut session = self.session.lock();
            if session.status != CallStatus::Calling {
                tracing::warn!("Answer received but no outgoing call in progress");
                return;
            }
            // Anzeigename darf mit dem Answer nachgereicht werden
            if let (Some(name), Some(peer)) = (callee_name, session.remote_peer.as_mut()) {
                peer.upgrade_display_name(name);
            }
            session.generation
        };

        let Some(engine) = self.current_engine() else {
            tracing::warn!("Answer received but no negotiation engine exists");
            return;
        };

        match engine.apply_remote_answer(sdp_answer).await {
            Ok(()) => {
                tracing::info!("Remote description set successfully");
                self.drain_candidate_queue(generation, &engine).await;
            }
            Err(e) => {
                tracing::error!("Error setting remote description: {}", e);
                self.fail_attempt(
                    generation,
                    "Error establishing call connection. Please try again.",
                );
            }
        }
    }

    // ========================================================================
    // INCOMING CALLS
    // ========================================================================

    /// Verarbeitet eine eingehende Einladung.
    ///
    /// Läuft bereits ein Anruf, wird mit `busy` geantwortet ohne die
    /// bestehende Session anzufassen. Ausnahme: ein Reconnect-Offer der
    /// aktuellen Gegenstelle wird als Reparatur-Offer erneut beantwortet.
    pub async fn handle_incoming_invitation(
        &self,
        caller_id: String,
        sdp_offer: String,
        caller_name: Option<String>,
        is_reconnect: bool,
    ) {
        enum Disposition {
            Fresh,
            Busy,
            ReconnectOffer,
        }

        let disposition = {
            let session = self.session.lock();
            if session.is_idle() {
                Disposition::Fresh
            } else if is_reconnect && session.remote_id() == Some(caller_id.as_str()) {
                Disposition::ReconnectOffer
            } else {
                Disposition::Busy
            }
        };

        match disposition {
            Disposition::Busy => {
                tracing::info!("Rejecting incoming call from {} (busy)", caller_id);
                if let Err(e) = self.signaling.send(OutboundSignal::End {
                    target_id: caller_id,
                    reason: CallEndReason::Busy,
                }) {
                    tracing::warn!("Failed to send busy signal: {}", e);
                }
            }

            Disposition::ReconnectOffer => {
                self.handle_reconnect_offer(&sdp_offer).await;
            }

            Disposition::Fresh => {
                let (generation, name) = {
                    let mut session = self.session.lock();
                    session.begin_incoming(caller_id.clone(), caller_name, sdp_offer);
                    let name = session
                        .remote_display_name()
                        .map(str::to_string)
                        .unwrap_or_default();
                    (session.generation, name)
                };

                tracing::info!("Incoming call from {} ({})", name, caller_id);
                self.emit_status(CallStatus::Ringing);
                self.notifier.show(&format!("Incoming call from {}", name));

                self.start_ring_timer(generation);
            }
        }
    }

    /// Nimmt den klingelnden Anruf an.
    pub async fn accept_incoming_call(&self) -> Result<(), CallError> {
        let (generation, offer, name) = {
            let mut session = self.session.lock();
            if session.status != CallStatus::Ringing {
                return Err(CallError::NoPendingInvitation);
            }
            let offer = session
                .pending_remote_offer
                .take()
                .ok_or(CallError::NoPendingInvitation)?;
            session.status = CallStatus::Connecting;
            let name = session
                .remote_display_name()
                .map(str::to_string)
                .unwrap_or_default();
            (session.generation, offer, name)
        };

        self.cancel_ring_timer();
        tracing::info!("Accepting incoming call from {}", name);
        self.emit_status(CallStatus::Connecting);
        self.notifier.show(&format!("Connecting to {}...", name));

        // Lokales Audio beschaffen
        let track = match self.media.acquire_audio().await {
            Ok(track) => track,
            Err(e) => {
                tracing::error!("Error accepting call: {}", e);
                if self.generation_matches(generation) {
                    self.notifier.show(media_error_text(&e, true));
                    self.cleanup(false);
                }
                return Err(e.into());
            }
        };

        {
            let mut session = self.session.lock();
            if session.generation != generation {
                drop(session);
                let mut track = track;
                track.release();
                return Err(CallError::SessionSuperseded);
            }
            session.local_track = Some(track);
        }

        // Engine aufbauen, Offer beantworten
        let engine = match self.create_engine(generation).await {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!("Error accepting call: {}", e);
                self.fail_attempt(generation, "Error connecting call. Please try again.");
                return Err(e);
            }
        };

        if let Err(e) = self.answer_offer(generation, &engine, &offer).await {
            tracing::error!("Error accepting call: {}", e);
            self.fail_attempt(generation, "Error connecting call. Please try again.");
            return Err(e);
        }

        Ok(())
    }

    /// Weist den klingelnden Anruf ab.
    pub fn reject_incoming_call(&self) -> Result<(), CallError> {
        let (caller_id, name) = {
            let session = self.session.lock();
            if session.status != CallStatus::Ringing {
                return Err(CallError::NoPendingInvitation);
            }
            let caller_id = session.remote_id().map(str::to_string).unwrap_or_default();
            let name = session
                .remote_display_name()
                .map(str::to_string)
                .unwrap_or_default();
            (caller_id, name)
        };

        self.cancel_ring_timer();
        tracing::info!("Rejecting incoming call from {}", caller_id);

        if let Err(e) = self.signaling.send(OutboundSignal::End {
            target_id: caller_id,
            reason: CallEndReason::Rejected,
        }) {
            tracing::warn!("Failed to send reject signal: {}", e);
        }

        self.notifier.show(&format!("Call from {} rejected", name));
        self.cleanup(false);
        Ok(())
    }

    // ========================================================================
    // CANDIDATES
    // ========================================================================

    /// Verarbeitet einen Remote-Kandidaten.
    ///
    /// Solange keine Remote-Description angewendet wurde, wird der
    /// Kandidat gequeued und beim Anwenden in Ankunftsreihenfolge
    /// nachgezogen. Ohne Session: No-op.
    pub async fn handle_remote_candidate(&self, candidate: &str) {
        let apply_now = {
            let mut session = self.session.lock();
            if session.is_idle() {
                return;
            }
            if !session.remote_description_set {
                session.queue_candidate(candidate.to_string());
                tracing::debug!(
                    "Queued remote candidate ({} pending)",
                    session.queued_remote_candidates.len()
                );
                false
            } else {
                true
            }
        };

        if !apply_now {
            return;
        }

        let Some(engine) = self.current_engine() else {
            return;
        };

        if let Err(e) = engine.add_remote_candidate(candidate).await {
            tracing::error!("Error adding remote candidate: {}", e);
        }
    }

    // ========================================================================
    // CONNECTIVITY
    // ========================================================================

    /// Verarbeitet einen Verbindungszustands-Wechsel der Engine.
    pub async fn on_connectivity_changed(&self, state: ConnectivityState) {
        match state {
            ConnectivityState::Connected => {
                let connected_name = {
                    let mut session = self.session.lock();
                    if session.is_idle() {
                        return;
                    }
                    session.reconnect_attempts = 0;
                    if matches!(
                        session.status,
                        CallStatus::Calling | CallStatus::Ringing | CallStatus::Connecting
                    ) {
                        session.status = CallStatus::Connected;
                        Some(
                            session
                                .remote_display_name()
                                .map(str::to_string)
                                .unwrap_or_default(),
                        )
                    } else {
                        None
                    }
                };

                if let Some(name) = connected_name {
                    tracing::info!("Peer connection established");
                    self.emit_status(CallStatus::Connected);
                    self.start_duration_timer();
                    self.notifier.show(&format!("Connected with {}", name));
                }
            }

            ConnectivityState::Disconnected => {
                tracing::info!("Peer connection disconnected, attempting repair");
                self.attempt_reconnect().await;
            }

            ConnectivityState::Failed => {
                if self.session.lock().is_idle() {
                    return;
                }
                tracing::error!("Peer connection failed");
                self.notifier.show("Call connection failed. Please try again.");
                self.cleanup(false);
            }

            // Closed kommt nur wenn das Cleanup die Engine bereits schließt
            ConnectivityState::New | ConnectivityState::Connecting | ConnectivityState::Closed => {}
        }
    }

    /// Reparatur-Prozedur bei transientem Verbindungsverlust.
    async fn attempt_reconnect(&self) {
        let (generation, direction, attempts) = {
            let mut session = self.session.lock();
            if session.is_idle() {
                return;
            }
            if session.reconnect_attempts >= MAX_RECONNECT_ATTEMPTS {
                drop(session);
                self.notifier
                    .show("Unable to reconnect call after multiple attempts.");
                self.cleanup(false);
                return;
            }
            session.reconnect_attempts += 1;
            // Frische Verbindung braucht einen frischen Austausch
            session.remote_description_set = false;
            session.queued_remote_candidates.clear();
            (
                session.generation,
                session.direction,
                session.reconnect_attempts,
            )
        };

        self.notifier.show(&format!(
            "Call connection lost. Attempting to reconnect... ({}/{})",
            attempts, MAX_RECONNECT_ATTEMPTS
        ));

        self.discard_engine();

        let engine = match self.create_engine(generation).await {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!("Error during reconnect: {}", e);
                self.fail_attempt(generation, "Failed to reconnect call.");
                return;
            }
        };

        // Nur die ausgehende Seite erneuert das Offer proaktiv; die
        // eingehende Seite wartet passiv auf ein frisches Offer der
        // Gegenstelle (bekannte Asymmetrie dieses Protokolls)
        if direction != Some(CallDirection::Outgoing) {
            return;
        }

        let offer = match engine.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::error!("Error during reconnect: {}", e);
                self.fail_attempt(generation, "Failed to reconnect call.");
                return;
            }
        };

        let target = {
            let session = self.session.lock();
            if session.generation != generation {
                return;
            }
            session.remote_id().map(str::to_string)
        };

        let Some(target) = target else { return };

        if let Err(e) = self.signaling.send(OutboundSignal::Invite {
            callee_id: target,
            sdp_offer: offer,
            caller_name: self.local_name.clone(),
            is_reconnect: Some(true),
        }) {
            tracing::warn!("Failed to send reconnect invite: {}", e);
            self.fail_attempt(generation, "Failed to reconnect call.");
        }
    }

    /// Beantwortet ein Reconnect-Offer der aktuellen Gegenstelle erneut.
    async fn handle_reconnect_offer(&self, sdp_offer: &str) {
        let generation = {
            let mut session = self.session.lock();
            session.remote_description_set = false;
            session.queued_remote_candidates.clear();
            session.generation
        };

        tracing::info!("Re-answering reconnect offer from peer");
        self.discard_engine();

        let engine = match self.create_engine(generation).await {
            Ok(engine) => engine,
            Err(e) => {
                tracing::error!("Error re-answering reconnect offer: {}", e);
                self.fail_attempt(generation, "Failed to reconnect call.");
                return;
            }
        };

        if let Err(e) = self.answer_offer(generation, &engine, sdp_offer).await {
            tracing::error!("Error re-answering reconnect offer: {}", e);
            self.fail_attempt(generation, "Failed to reconnect call.");
        }
    }

    // ========================================================================
    // CALL TERMINATION
    // ========================================================================

    /// Beendet den aktuellen Anruf lokal.
    pub fn end_call(&self) -> Result<(), CallError> {
        let (status, target) = {
            let session = self.session.lock();
            if session.is_idle() {
                return Err(CallError::NoActiveCall);
            }
            (session.status, session.remote_id().map(str::to_string))
        };

        tracing::info!("Ending call");

        if matches!(
            status,
            CallStatus::Calling | CallStatus::Ringing | CallStatus::Connected
        ) {
            if let Some(target_id) = target {
                if let Err(e) = self.signaling.send(OutboundSignal::End {
                    target_id,
                    reason: CallEndReason::Ended,
                }) {
                    tracing::warn!("Failed to send end signal: {}", e);
                }
            }
        }

        self.cleanup(true);
        Ok(())
    }

    /// Verarbeitet das Ende-Signal der Gegenstelle.
    ///
    /// Sendet selbst kein Ende-Signal zurück (verhindert
    /// Signalisierungs-Schleifen). Auf einer Idle-Session ein No-op,
    /// damit Relay-Duplikate harmlos bleiben.
    pub fn handle_remote_end(&self, reason: Option<CallEndReason>) {
        let (name, status, duration) = {
            let session = self.session.lock();
            if session.is_idle() {
                return;
            }
            let name = session
                .remote_display_name()
                .map(str::to_string)
                .unwrap_or_default();
            (name, session.status, session.duration_secs)
        };

        tracing::info!("Remote peer ended the call (reason: {:?})", reason);

        let message = match reason {
            Some(CallEndReason::Busy) => format!("{} is busy.", name),
            Some(CallEndReason::Rejected) => format!("{} declined the call.", name),
            Some(CallEndReason::UserDisconnected) => format!("{} disconnected.", name),
            _ => {
                if status == CallStatus::Connected && duration > 0 {
                    format!("Call ended. Duration: {}", format_duration(duration))
                } else {
                    format!("Call ended by {}.", name)
                }
            }
        };

        self.notifier.show(&message);
        self.cleanup(false);
    }

    // ========================================================================
    // MUTE
    // ========================================================================

    /// Schaltet das lokale Mikrofon um. No-op ohne lokalen Track.
    ///
    /// Gibt den neuen Mute-Status zurück.
    pub fn toggle_mute(&self) -> bool {
        let muted = {
            let mut session = self.session.lock();
            if session.local_track.is_none() {
                return session.is_muted;
            }
            session.is_muted = !session.is_muted;
            let muted = session.is_muted;
            if let Some(track) = session.local_track.as_ref() {
                track.set_enabled(!muted);
            }
            muted
        };

        self.notifier.show(if muted {
            "Your microphone is now muted"
        } else {
            "Your microphone is now unmuted"
        });

        muted
    }

    // ========================================================================
    // CLEANUP
    // ========================================================================

    /// Räumt die Session deterministisch ab. Läuft auf jedem terminalen
    /// Pfad: Timer stoppen, Track freigeben, Engine verwerfen, Felder auf
    /// Idle-Defaults, frische Generation.
    fn cleanup(&self, show_duration: bool) {
        // Timer stoppen
        {
            let mut timers = self.timers.lock();
            if let Some(handle) = timers.ring_timeout.take() {
                handle.abort();
            }
            if let Some(handle) = timers.duration_tick.take() {
                handle.abort();
            }
        }

        self.discard_engine();

        let final_duration = {
            let mut session = self.session.lock();
            let final_duration = session.duration_secs;

            // Lokalen Track stoppen und freigeben
            if let Some(mut track) = session.local_track.take() {
                track.release();
            }
            session.remote_track_attached = false;
            session.status = CallStatus::Ended;

            final_duration
        };

        self.emit_status(CallStatus::Ended);

        self.session.lock().reset();
        self.emit_status(CallStatus::Idle);

        // Abschluss-Nachricht, sofern kein spezifischerer Text gezeigt wurde
        if show_duration && final_duration > 0 {
            self.notifier.show(&format!(
                "Call ended. Duration: {}",
                format_duration(final_duration)
            ));
        }

        tracing::info!("Call session cleaned up");
    }

    /// Meldet einen fehlgeschlagenen Versuch und räumt ab, sofern die
    /// Session nicht schon ersetzt wurde.
    fn fail_attempt(&self, generation: SessionGeneration, message: &str) {
        if !self.generation_matches(generation) {
            return;
        }
        self.notifier.show(message);
        self.cleanup(false);
    }

    /// Verwirft die aktuelle Engine samt Event-Pump.
    fn discard_engine(&self) {
        if let Some(handle) = self.timers.lock().event_pump.take() {
            handle.abort();
        }
        if let Some(engine) = self.engine.lock().take() {
            tokio::spawn(async move { engine.close().await });
        }
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn generation_matches(&self, generation: SessionGeneration) -> bool {
        self.session.lock().generation == generation
    }

    fn current_engine(&self) -> Option<Arc<dyn NegotiationEngine>> {
        self.engine.lock().clone()
    }

    /// Meldet genau einen Status-Übergang an den Notifier.
    fn emit_status(&self, status: CallStatus) {
        let name = self
            .session
            .lock()
            .remote_display_name()
            .map(str::to_string);
        tracing::info!("Call status changed: {:?}", status);
        self.notifier.status_changed(status, name.as_deref());
    }

    /// Erzeugt eine frische Engine, startet deren Event-Pump und hängt
    /// das lokale Audio an.
    async fn create_engine(
        &self,
        generation: SessionGeneration,
    ) -> Result<Arc<dyn NegotiationEngine>, CallError> {
        let engine = self.negotiation.create().await?;

        if !self.generation_matches(generation) {
            tokio::spawn(async move { engine.close().await });
            return Err(CallError::SessionSuperseded);
        }

        self.spawn_event_pump(engine.subscribe(), generation);
        *self.engine.lock() = Some(Arc::clone(&engine));

        engine.add_local_audio().await?;
        Ok(engine)
    }

    /// Pumpt Engine-Events in die State Machine, solange die Generation
    /// noch stimmt.
    fn spawn_event_pump(
        &self,
        mut events: broadcast::Receiver<NegotiationEvent>,
        generation: SessionGeneration,
    ) {
        let me = self.me.clone();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(manager) = me.upgrade() else { break };
                        if !manager.generation_matches(generation) {
                            break;
                        }
                        match event {
                            NegotiationEvent::LocalCandidate(candidate) => {
                                manager.send_local_candidate(&candidate);
                            }
                            NegotiationEvent::RemoteTrack => {
                                tracing::info!("Remote audio track attached");
                                manager.session.lock().remote_track_attached = true;
                            }
                            NegotiationEvent::Connectivity(state) => {
                                manager.on_connectivity_changed(state).await;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Negotiation event pump lagged, {} events dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        if let Some(old) = self.timers.lock().event_pump.replace(handle) {
            old.abort();
        }
    }

    /// Signalisiert einen lokal entdeckten Kandidaten an die Gegenstelle.
    fn send_local_candidate(&self, candidate: &str) {
        let target = self.session.lock().remote_id().map(str::to_string);
        let Some(target_id) = target else { return };

        if let Err(e) = self.signaling.send(OutboundSignal::Candidate {
            candidate: candidate.to_string(),
            target_id,
        }) {
            tracing::warn!("Failed to send local candidate: {}", e);
        }
    }

    /// Wendet ein Remote-Offer an, zieht die Kandidaten-Queue nach und
    /// schickt das Answer an die Gegenstelle.
    async fn answer_offer(
        &self,
        generation: SessionGeneration,
        engine: &Arc<dyn NegotiationEngine>,
        sdp_offer: &str,
    ) -> Result<(), CallError> {
        engine.apply_remote_offer(sdp_offer).await?;
        self.drain_candidate_queue(generation, engine).await;

        let sdp_answer = engine.create_answer().await?;

        let target_id = {
            let session = self.session.lock();
            if session.generation != generation {
                return Err(CallError::SessionSuperseded);
            }
            session
                .remote_id()
                .map(str::to_string)
                .ok_or(CallError::NoActiveCall)?
        };

        self.signaling.send(OutboundSignal::Answer {
            caller_id: target_id,
            sdp_answer,
            callee_name: self.local_name.clone(),
        })?;

        Ok(())
    }

    /// Markiert die Remote-Description als gesetzt und wendet alle
    /// gequeueten Kandidaten in Ankunftsreihenfolge an.
    async fn drain_candidate_queue(
        &self,
        generation: SessionGeneration,
        engine: &Arc<dyn NegotiationEngine>,
    ) {
        let queued = {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            session.remote_description_set = true;
            session.drain_candidates()
        };

        for candidate in queued {
            if let Err(e) = engine.add_remote_candidate(&candidate).await {
                tracing::error!("Error adding queued candidate: {}", e);
            }
        }
    }

    // ========================================================================
    // TIMERS
    // ========================================================================

    /// Startet den Auto-Reject-Timer für einen klingelnden Anruf.
    fn start_ring_timer(&self, generation: SessionGeneration) {
        let me = self.me.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(RING_TIMEOUT_SECS)).await;

            let Some(manager) = me.upgrade() else { return };
            if !manager.generation_matches(generation) {
                return;
            }
            if manager.session.lock().status != CallStatus::Ringing {
                return;
            }

            tracing::info!("Incoming call timed out");
            manager
                .notifier
                .show(&format!("Call timed out after {} seconds", RING_TIMEOUT_SECS));
            let _ = manager.reject_incoming_call();
        });

        if let Some(old) = self.timers.lock().ring_timeout.replace(handle) {
            old.abort();
        }
    }

    fn cancel_ring_timer(&self) {
        if let Some(handle) = self.timers.lock().ring_timeout.take() {
            handle.abort();
        }
    }

    /// Startet den Gesprächsdauer-Timer (1s-Takt solange Connected).
    fn start_duration_timer(&self) {
        let generation = self.session.lock().generation;
        let me = self.me.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            // Der erste Tick feuert sofort
            interval.tick().await;
            if let Some(manager) = me.upgrade() {
                manager.notifier.duration_tick(0);
            }

            loop {
                interval.tick().await;

                let Some(manager) = me.upgrade() else { break };
                if !manager.generation_matches(generation) {
                    break;
                }

                let seconds = {
                    let mut session = manager.session.lock();
                    if session.status != CallStatus::Connected {
                        break;
                    }
                    session.duration_secs += 1;
                    session.duration_secs
                };

                manager.notifier.duration_tick(seconds);

                // Checkpoints für lange Gespräche
                if seconds == 60 {
                    manager.notifier.show("Call in progress (1 minute)");
                } else if seconds == 300 {
                    manager.notifier.show("Call in progress (5 minutes)");
                } else if seconds % 600 == 0 {
                    manager
                        .notifier
                        .show(&format!("Call in progress ({} minutes)", seconds / 60));
                }
            }
        });

        if let Some(old) = self.timers.lock().duration_tick.replace(handle) {
            old.abort();
        }
    }

    #[cfg(test)]
    fn set_duration_for_test(&self, seconds: u64) {
        self.session.lock().duration_secs = seconds;
    }
}

impl std::fmt::Debug for CallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallManager")
            .field("local_id", &self.local_id)
            .field("session", &*self.session.lock())
            .finish()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

/// Benutzer-Text für Media-Fehler, abhängig von der Anrufrichtung.
fn media_error_text(error: &MediaError, accepting: bool) -> &'static str {
    match error {
        MediaError::PermissionDenied if accepting => {
            "Microphone access denied. Please allow microphone access to accept calls."
        }
        MediaError::PermissionDenied => {
            "Microphone access denied. Please allow microphone access in your system settings."
        }
        MediaError::DeviceError(_) => {
            "Could not access microphone. Please check your device settings."
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    // ------------------------------------------------------------------
    // Fake-Kollaborateure
    // ------------------------------------------------------------------

    /// Beobachtet was mit dem ausgegebenen Track passiert
    #[derive(Default)]
    struct TrackProbe {
        enabled: Mutex<bool>,
        released: Mutex<bool>,
    }

    struct FakeTrack {
        probe: Arc<TrackProbe>,
    }

    impl crate::media::LocalTrack for FakeTrack {
        fn set_enabled(&self, enabled: bool) {
            *self.probe.enabled.lock() = enabled;
        }

        fn release(&mut self) {
            *self.probe.released.lock() = true;
        }
    }

    struct FakeMedia {
        probe: Arc<TrackProbe>,
        fail_with: Option<MediaError>,
    }

    #[async_trait]
    impl MediaProvider for FakeMedia {
        async fn acquire_audio(&self) -> Result<Box<dyn crate::media::LocalTrack>, MediaError> {
            match &self.fail_with {
                Some(error) => Err(error.clone()),
                None => {
                    *self.probe.enabled.lock() = true;
                    Ok(Box::new(FakeTrack {
                        probe: Arc::clone(&self.probe),
                    }))
                }
            }
        }
    }

    /// Protokolliert alle Engine-Operationen über alle Inkarnationen
    #[derive(Default)]
    struct EngineLog {
        engines_created: usize,
        offers_created: usize,
        answers_created: usize,
        applied_offers: Vec<String>,
        applied_answers: Vec<String>,
        candidates: Vec<String>,
        audio_attached: usize,
        closed: usize,
    }

    struct FakeEngine {
        log: Arc<Mutex<EngineLog>>,
        event_tx: broadcast::Sender<NegotiationEvent>,
    }

    #[async_trait]
    impl NegotiationEngine for FakeEngine {
        fn subscribe(&self) -> broadcast::Receiver<NegotiationEvent> {
            self.event_tx.subscribe()
        }

        async fn add_local_audio(&self) -> Result<(), NegotiationError> {
            self.log.lock().audio_attached += 1;
            Ok(())
        }

        async fn create_offer(&self) -> Result<String, NegotiationError> {
            self.log.lock().offers_created += 1;
            Ok("offer-sdp".to_string())
        }

        async fn create_answer(&self) -> Result<String, NegotiationError> {
            self.log.lock().answers_created += 1;
            Ok("answer-sdp".to_string())
        }

        async fn apply_remote_offer(&self, sdp: &str) -> Result<(), NegotiationError> {
            self.log.lock().applied_offers.push(sdp.to_string());
            Ok(())
        }

        async fn apply_remote_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
            self.log.lock().applied_answers.push(sdp.to_string());
            Ok(())
        }

        async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError> {
            self.log.lock().candidates.push(candidate.to_string());
            Ok(())
        }

        async fn close(&self) {
            self.log.lock().closed += 1;
        }
    }

    struct FakeNegotiationFactory {
        log: Arc<Mutex<EngineLog>>,
    }

    #[async_trait]
    impl NegotiationFactory for FakeNegotiationFactory {
        async fn create(&self) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
            self.log.lock().engines_created += 1;
            let (event_tx, _) = broadcast::channel(16);
            Ok(Arc::new(FakeEngine {
                log: Arc::clone(&self.log),
                event_tx,
            }))
        }
    }

    #[derive(Default)]
    struct FakeSignaling {
        sent: Mutex<Vec<OutboundSignal>>,
    }

    impl SignalingChannel for FakeSignaling {
        fn send(&self, signal: OutboundSignal) -> Result<(), SignalingError> {
            self.sent.lock().push(signal);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<String>>,
        statuses: Mutex<Vec<CallStatus>>,
    }

    impl Notifier for RecordingNotifier {
        fn show(&self, text: &str) {
            self.messages.lock().push(text.to_string());
        }

        fn status_changed(&self, status: CallStatus, _peer_name: Option<&str>) {
            self.statuses.lock().push(status);
        }

        fn duration_tick(&self, _seconds: u64) {}
    }

    // ------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------

    struct Harness {
        manager: Arc<CallManager>,
        track: Arc<TrackProbe>,
        engine_log: Arc<Mutex<EngineLog>>,
        signaling: Arc<FakeSignaling>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_media_failure(None)
        }

        fn with_media_failure(fail_with: Option<MediaError>) -> Self {
            let track = Arc::new(TrackProbe::default());
            let engine_log = Arc::new(Mutex::new(EngineLog::default()));
            let signaling = Arc::new(FakeSignaling::default());
            let notifier = Arc::new(RecordingNotifier::default());

            let manager = CallManager::new(
                "local-peer".to_string(),
                "Alice".to_string(),
                Arc::new(FakeMedia {
                    probe: Arc::clone(&track),
                    fail_with,
                }),
                Arc::new(FakeNegotiationFactory {
                    log: Arc::clone(&engine_log),
                }),
                Arc::clone(&signaling) as Arc<dyn SignalingChannel>,
                Arc::clone(&notifier) as Arc<dyn Notifier>,
            );

            Self {
                manager,
                track,
                engine_log,
                signaling,
                notifier,
            }
        }

        fn messages(&self) -> Vec<String> {
            self.notifier.messages.lock().clone()
        }

        fn statuses(&self) -> Vec<CallStatus> {
            self.notifier.statuses.lock().clone()
        }

        fn sent(&self) -> Vec<OutboundSignal> {
            self.signaling.sent.lock().clone()
        }

        /// Baut einen verbundenen ausgehenden Anruf zu `peer-b` auf.
        async fn connected_outgoing_call(&self) {
            self.manager.start_outgoing_call("peer-b").await.unwrap();
            self.manager
                .handle_call_answered("remote-answer", Some("Bob"))
                .await;
            self.manager
                .on_connectivity_changed(ConnectivityState::Connected)
                .await;
            assert_eq!(self.manager.status(), CallStatus::Connected);
        }
    }

    // ------------------------------------------------------------------
    // Eigenschaften der State Machine
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_end_call_releases_track_and_returns_to_idle() {
        let h = Harness::new();

        h.manager.start_outgoing_call("peer-b").await.unwrap();
        assert_eq!(h.manager.status(), CallStatus::Calling);

        h.manager.end_call().unwrap();

        assert_eq!(h.manager.status(), CallStatus::Idle);
        assert!(*h.track.released.lock());
        assert!(h.sent().iter().any(|s| matches!(
            s,
            OutboundSignal::End {
                target_id,
                reason: CallEndReason::Ended,
            } if target_id == "peer-b"
        )));
    }

    #[tokio::test]
    async fn test_second_outgoing_call_is_rejected() {
        let h = Harness::new();

        h.manager.start_outgoing_call("peer-b").await.unwrap();

        let result = h.manager.start_outgoing_call("peer-c").await;
        assert!(matches!(result, Err(CallError::AlreadyInCall)));

        // Bestehende Session bleibt unverändert
        assert_eq!(h.manager.status(), CallStatus::Calling);
        let session = h.manager.session.lock();
        assert_eq!(session.remote_id(), Some("peer-b"));
    }

    #[tokio::test]
    async fn test_calling_yourself_is_rejected() {
        let h = Harness::new();

        let result = h.manager.start_outgoing_call("local-peer").await;
        assert!(matches!(result, Err(CallError::SelfCallRejected)));
        assert_eq!(h.manager.status(), CallStatus::Idle);
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description() {
        let h = Harness::new();

        h.manager
            .handle_incoming_invitation(
                "peer-a".to_string(),
                "caller-offer".to_string(),
                Some("Bob".to_string()),
                false,
            )
            .await;
        assert_eq!(h.manager.status(), CallStatus::Ringing);

        // Kandidaten treffen vor der Remote-Description ein
        h.manager.handle_remote_candidate("cand-1").await;
        h.manager.handle_remote_candidate("cand-2").await;
        assert!(h.engine_log.lock().candidates.is_empty());

        // Annahme wendet das Offer an und zieht die Queue in Reihenfolge nach
        h.manager.accept_incoming_call().await.unwrap();
        assert_eq!(h.engine_log.lock().applied_offers, vec!["caller-offer"]);
        assert_eq!(h.engine_log.lock().candidates, vec!["cand-1", "cand-2"]);
        assert!(h.manager.session.lock().queued_remote_candidates.is_empty());

        // Nachzügler gehen jetzt direkt an die Engine
        h.manager.handle_remote_candidate("cand-3").await;
        assert_eq!(
            h.engine_log.lock().candidates,
            vec!["cand-1", "cand-2", "cand-3"]
        );
    }

    #[tokio::test]
    async fn test_candidate_without_session_is_ignored() {
        let h = Harness::new();

        h.manager.handle_remote_candidate("cand-1").await;

        assert!(h.engine_log.lock().candidates.is_empty());
        assert!(h.manager.session.lock().queued_remote_candidates.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_invitation_times_out_after_30_seconds() {
        let h = Harness::new();

        h.manager
            .handle_incoming_invitation(
                "peer-a".to_string(),
                "caller-offer".to_string(),
                Some("Bob".to_string()),
                false,
            )
            .await;
        assert_eq!(h.manager.status(), CallStatus::Ringing);

        // Timer ablaufen lassen
        tokio::time::sleep(Duration::from_secs(RING_TIMEOUT_SECS + 1)).await;
        tokio::task::yield_now().await;

        assert_eq!(h.manager.status(), CallStatus::Idle);
        assert!(h.sent().iter().any(|s| matches!(
            s,
            OutboundSignal::End {
                target_id,
                reason: CallEndReason::Rejected,
            } if target_id == "peer-a"
        )));
        assert!(h
            .messages()
            .iter()
            .any(|m| m.contains("Call timed out after 30 seconds")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_accepting_cancels_the_ring_timer() {
        let h = Harness::new();

        h.manager
            .handle_incoming_invitation(
                "peer-a".to_string(),
                "caller-offer".to_string(),
                None,
                false,
            )
            .await;
        h.manager.accept_incoming_call().await.unwrap();
        assert_eq!(h.manager.status(), CallStatus::Connecting);

        // Antwort wurde an den Anrufer geschickt
        assert!(h.sent().iter().any(|s| matches!(
            s,
            OutboundSignal::Answer {
                caller_id,
                sdp_answer,
                callee_name,
            } if caller_id == "peer-a" && sdp_answer == "answer-sdp" && callee_name == "Alice"
        )));

        h.manager
            .on_connectivity_changed(ConnectivityState::Connected)
            .await;
        assert_eq!(h.manager.status(), CallStatus::Connected);

        // Weit über den Ring-Timeout hinaus: kein Auto-Reject mehr
        tokio::time::sleep(Duration::from_secs(RING_TIMEOUT_SECS * 2)).await;
        tokio::task::yield_now().await;
        assert_eq!(h.manager.status(), CallStatus::Connected);
    }

    #[tokio::test]
    async fn test_reconnect_attempts_are_capped() {
        let h = Harness::new();
        h.connected_outgoing_call().await;

        // Drei Abbrüche werden repariert
        for attempt in 1..=3u32 {
            h.manager
                .on_connectivity_changed(ConnectivityState::Disconnected)
                .await;
            assert_eq!(h.manager.status(), CallStatus::Connected);
            assert!(h
                .messages()
                .iter()
                .any(|m| m.contains(&format!("({}/3)", attempt))));
        }

        // Initial-Engine + 3 Reparaturen, jede ausgehende Reparatur
        // schickt ein frisches Reconnect-Invite
        assert_eq!(h.engine_log.lock().engines_created, 4);
        let reconnect_invites = h
            .sent()
            .iter()
            .filter(|s| matches!(
                s,
                OutboundSignal::Invite {
                    is_reconnect: Some(true),
                    ..
                }
            ))
            .count();
        assert_eq!(reconnect_invites, 3);

        // Der vierte Abbruch überschreitet das Budget: fatal, kein Versuch mehr
        h.manager
            .on_connectivity_changed(ConnectivityState::Disconnected)
            .await;

        assert_eq!(h.manager.status(), CallStatus::Idle);
        assert_eq!(h.engine_log.lock().engines_created, 4);
        assert!(*h.track.released.lock());
        assert!(h
            .messages()
            .iter()
            .any(|m| m.contains("Unable to reconnect call after multiple attempts.")));
    }

    #[tokio::test]
    async fn test_successful_connection_resets_reconnect_budget() {
        let h = Harness::new();
        h.connected_outgoing_call().await;

        h.manager
            .on_connectivity_changed(ConnectivityState::Disconnected)
            .await;
        h.manager
            .on_connectivity_changed(ConnectivityState::Disconnected)
            .await;
        assert_eq!(h.manager.session.lock().reconnect_attempts, 2);

        // Reparatur erfolgreich: Budget wieder voll
        h.manager
            .on_connectivity_changed(ConnectivityState::Connected)
            .await;
        assert_eq!(h.manager.session.lock().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_full_outgoing_call_with_mute() {
        let h = Harness::new();

        h.manager.start_outgoing_call("peer-b").await.unwrap();

        // Einladung ging mit Offer und eigenem Namen raus
        assert!(h.sent().iter().any(|s| matches!(
            s,
            OutboundSignal::Invite {
                callee_id,
                sdp_offer,
                caller_name,
                is_reconnect: None,
            } if callee_id == "peer-b" && sdp_offer == "offer-sdp" && caller_name == "Alice"
        )));

        h.manager
            .handle_call_answered("remote-answer", Some("Bob"))
            .await;
        assert_eq!(h.engine_log.lock().applied_answers, vec!["remote-answer"]);

        // Anzeigename wurde mit dem Answer nachgereicht
        assert_eq!(
            h.manager.session.lock().remote_display_name(),
            Some("Bob")
        );

        h.manager
            .on_connectivity_changed(ConnectivityState::Connected)
            .await;
        assert_eq!(h.manager.status(), CallStatus::Connected);

        // Mute ändert den Track, nicht den Status
        assert!(h.manager.toggle_mute());
        assert!(h.manager.is_muted());
        assert_eq!(h.manager.status(), CallStatus::Connected);
        assert!(!*h.track.enabled.lock());

        assert!(!h.manager.toggle_mute());
        assert!(*h.track.enabled.lock());
    }

    #[tokio::test]
    async fn test_toggle_mute_without_track_is_noop() {
        let h = Harness::new();

        assert!(!h.manager.toggle_mute());
        assert!(!h.manager.is_muted());
        assert!(h.messages().is_empty());
    }

    #[tokio::test]
    async fn test_busy_rejects_second_invitation_without_touching_session() {
        let h = Harness::new();
        h.connected_outgoing_call().await;

        h.manager
            .handle_incoming_invitation(
                "peer-c".to_string(),
                "other-offer".to_string(),
                Some("Carol".to_string()),
                false,
            )
            .await;

        // Besetzt-Signal an den zweiten Anrufer
        assert!(h.sent().iter().any(|s| matches!(
            s,
            OutboundSignal::End {
                target_id,
                reason: CallEndReason::Busy,
            } if target_id == "peer-c"
        )));

        // Bestehende Session unangetastet
        assert_eq!(h.manager.status(), CallStatus::Connected);
        assert_eq!(h.manager.session.lock().remote_id(), Some("peer-b"));
        assert!(h.manager.session.lock().pending_remote_offer.is_none());
    }

    #[tokio::test]
    async fn test_caller_sees_busy_outcome() {
        let h = Harness::new();

        h.manager.start_outgoing_call("peer-b").await.unwrap();
        h.manager.handle_remote_end(Some(CallEndReason::Busy));

        assert!(h.messages().iter().any(|m| m.contains("is busy")));
        assert_eq!(h.manager.status(), CallStatus::Idle);
        // Übergang lief über Ended nach Idle
        let statuses = h.statuses();
        let ended_pos = statuses.iter().position(|s| *s == CallStatus::Ended);
        let idle_pos = statuses.iter().rposition(|s| *s == CallStatus::Idle);
        assert!(ended_pos.is_some());
        assert!(ended_pos < idle_pos);
    }

    #[tokio::test]
    async fn test_remote_end_reports_duration() {
        let h = Harness::new();
        h.connected_outgoing_call().await;
        h.manager.set_duration_for_test(125);

        let signals_before = h.sent().len();
        h.manager.handle_remote_end(Some(CallEndReason::Ended));

        assert!(h.messages().iter().any(|m| m.contains("2:05")));
        assert_eq!(h.manager.status(), CallStatus::Idle);
        // Kein erneutes Ende-Signal an die Gegenstelle
        assert_eq!(h.sent().len(), signals_before);
    }

    #[tokio::test]
    async fn test_remote_reject_is_reported() {
        let h = Harness::new();

        h.manager.start_outgoing_call("peer-b").await.unwrap();
        h.manager
            .handle_call_answered("remote-answer", Some("Bob"))
            .await;
        h.manager.handle_remote_end(Some(CallEndReason::Rejected));

        assert!(h
            .messages()
            .iter()
            .any(|m| m.contains("Bob declined the call.")));
        assert_eq!(h.manager.status(), CallStatus::Idle);
    }

    #[tokio::test]
    async fn test_permission_denied_cleans_up_without_sending() {
        let h = Harness::with_media_failure(Some(MediaError::PermissionDenied));

        let result = h.manager.start_outgoing_call("peer-b").await;

        assert!(matches!(
            result,
            Err(CallError::Media(MediaError::PermissionDenied))
        ));
        assert_eq!(h.manager.status(), CallStatus::Idle);
        assert!(h.sent().is_empty());
        assert!(h
            .messages()
            .iter()
            .any(|m| m.contains("Microphone access denied")));
    }

    #[tokio::test]
    async fn test_connection_failure_is_fatal() {
        let h = Harness::new();
        h.connected_outgoing_call().await;

        h.manager
            .on_connectivity_changed(ConnectivityState::Failed)
            .await;

        assert_eq!(h.manager.status(), CallStatus::Idle);
        assert!(*h.track.released.lock());
        assert!(h
            .messages()
            .iter()
            .any(|m| m.contains("Call connection failed")));
    }

    #[tokio::test]
    async fn test_reject_incoming_call_sends_rejected() {
        let h = Harness::new();

        h.manager
            .handle_incoming_invitation(
                "peer-a".to_string(),
                "caller-offer".to_string(),
                Some("Bob".to_string()),
                false,
            )
            .await;
        h.manager.reject_incoming_call().unwrap();

        assert_eq!(h.manager.status(), CallStatus::Idle);
        assert!(h.sent().iter().any(|s| matches!(
            s,
            OutboundSignal::End {
                target_id,
                reason: CallEndReason::Rejected,
            } if target_id == "peer-a"
        )));
        assert!(h
            .messages()
            .iter()
            .any(|m| m.contains("Call from Bob rejected")));
    }

    #[tokio::test]
    async fn test_reconnect_offer_from_current_peer_is_re_answered() {
        let h = Harness::new();

        // Eingehender verbundener Anruf mit peer-a
        h.manager
            .handle_incoming_invitation(
                "peer-a".to_string(),
                "caller-offer".to_string(),
                Some("Bob".to_string()),
                false,
            )
            .await;
        h.manager.accept_incoming_call().await.unwrap();
        h.manager
            .on_connectivity_changed(ConnectivityState::Connected)
            .await;

        // Reconnect-Offer der Gegenstelle wird nicht als besetzt abgewiesen
        h.manager
            .handle_incoming_invitation(
                "peer-a".to_string(),
                "reconnect-offer".to_string(),
                Some("Bob".to_string()),
                true,
            )
            .await;

        assert!(!h.sent().iter().any(|s| matches!(
            s,
            OutboundSignal::End {
                reason: CallEndReason::Busy,
                ..
            }
        )));
        assert_eq!(h.engine_log.lock().engines_created, 2);
        assert_eq!(
            h.engine_log.lock().applied_offers,
            vec!["caller-offer", "reconnect-offer"]
        );
        assert_eq!(h.engine_log.lock().answers_created, 2);
    }

    #[tokio::test]
    async fn test_end_call_without_session_fails() {
        let h = Harness::new();
        assert!(matches!(h.manager.end_call(), Err(CallError::NoActiveCall)));
    }
}
