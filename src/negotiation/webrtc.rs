//! WebRTC-Implementierung der Negotiation Engine
//!
//! Baut pro Anruf-Versuch eine frische RTCPeerConnection mit
//! Default-Codecs und -Interceptors auf und übersetzt deren Callbacks in
//! `NegotiationEvent`s.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

use crate::media::SAMPLE_RATE;

use super::engine::{
    ConnectivityState, NegotiationEngine, NegotiationError, NegotiationEvent, NegotiationFactory,
};

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        },
    ]
}

/// Übersetzt den Peer-Connection-Zustand in die Engine-Taxonomie.
fn map_peer_state(state: RTCPeerConnectionState) -> Option<ConnectivityState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectivityState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectivityState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectivityState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectivityState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectivityState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectivityState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Factory für WebRTC-Engines mit konfigurierbaren ICE-Servern
pub struct WebRtcNegotiationFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcNegotiationFactory {
    pub fn new() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }

    /// Setzt optionale TURN-Server Credentials
    pub fn set_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
    }
}

impl Default for WebRtcNegotiationFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NegotiationFactory for WebRtcNegotiationFactory {
    async fn create(&self) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
        let engine = WebRtcNegotiation::new(self.ice_servers.clone()).await?;
        Ok(Arc::new(engine))
    }
}

// ============================================================================
// WEBRTC NEGOTIATION
// ============================================================================

/// Negotiation Engine auf Basis einer RTCPeerConnection
pub struct WebRtcNegotiation {
    pc: Arc<RTCPeerConnection>,
    event_tx: broadcast::Sender<NegotiationEvent>,
}

impl WebRtcNegotiation {
    /// Erstellt eine frische Peer Connection inkl. Event-Handlern.
    pub async fn new(ice_servers: Vec<RTCIceServer>) -> Result<Self, NegotiationError> {
        // Media Engine mit Default-Codecs konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| NegotiationError::Peer(e.to_string()))?,
        );

        let (event_tx, _) = broadcast::channel(100);

        let engine = Self { pc, event_tx };
        engine.setup_handlers();

        Ok(engine)
    }

    /// Registriert die Callbacks der Peer Connection.
    fn setup_handlers(&self) {
        // Connection State Handler
        let event_tx = self.event_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::info!("Peer connection state: {:?}", s);

                if let Some(state) = map_peer_state(s) {
                    let _ = event_tx.send(NegotiationEvent::Connectivity(state));
                }

                Box::pin(async {})
            }));

        // ICE Candidate Handler
        let event_tx = self.event_tx.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                if let Ok(json) = c.to_json() {
                    if let Ok(candidate_str) = serde_json::to_string(&json) {
                        let _ = event_tx.send(NegotiationEvent::LocalCandidate(candidate_str));
                    }
                }
            }
            Box::pin(async {})
        }));

        // Track Handler (eingehendes Audio)
        let event_tx = self.event_tx.clone();
        self.pc.on_track(Box::new(move |track, _, _| {
            let event_tx = event_tx.clone();
            Box::pin(async move {
                tracing::info!("Received remote track: {:?}", track.codec());
                let _ = event_tx.send(NegotiationEvent::RemoteTrack);
            })
        }));
    }
}

#[async_trait]
impl NegotiationEngine for WebRtcNegotiation {
    fn subscribe(&self) -> broadcast::Receiver<NegotiationEvent> {
        self.event_tx.subscribe()
    }

    async fn add_local_audio(&self) -> Result<(), NegotiationError> {
        // Opus RTP Track; die Samples liefert der CaptureTrack der Session
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "peercall".to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        Ok(())
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))?;

        Ok(answer.sdp)
    }

    async fn apply_remote_offer(&self, sdp: &str) -> Result<(), NegotiationError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<(), NegotiationError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| NegotiationError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), NegotiationError> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|e| NegotiationError::InvalidCandidate(e.to_string()))?;

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| NegotiationError::Peer(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
