//! WebRTC peer connections as a negotiation transport
//!
//! This module contains:
//! - ICE server configuration (STUN/TURN)
//! - `WebRtcTransport`, creating one `WebRtcPeer` per connection attempt
//! - Candidate collection and connection diagnostics

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::{SctpMaxMessageSize, SettingEngine};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use duet_common::session::{
    NegotiationSession, Transport, TransportEvent, TransportEvents, TransportState, CHANNEL_LABEL,
};
use duet_common::signaling::{CandidateInfo, CandidatePayload};

use crate::webrtc::channel::RtcChannel;

// ============================================================================
// Constants
// ============================================================================

/// Google STUN server for NAT traversal
const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Largest SCTP message either side may send. Chunks stay well below this.
const SCTP_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

// ============================================================================
// ICE configuration
// ============================================================================

/// TURN server credentials
#[derive(Debug, Clone)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

/// ICE servers handed to every peer connection
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec![STUN_SERVER.to_string()],
            turn: None,
        }
    }
}

impl IceConfig {
    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(RTCIceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            });
        }
        if let Some(turn) = &self.turn {
            servers.push(RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
            });
        }
        servers
    }
}

fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .context("Failed to register default codecs")?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .context("Failed to register interceptors")?;

    let mut setting_engine = SettingEngine::default();
    setting_engine
        .set_sctp_max_message_size_can_send(SctpMaxMessageSize::Bounded(SCTP_MAX_MESSAGE_SIZE));

    Ok(APIBuilder::new()
        .with_setting_engine(setting_engine)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Advertise our receive limit; without the attribute peers assume 64 KiB
fn advertise_max_message_size(mut sdp: String) -> String {
    if !sdp.contains("a=max-message-size:") {
        sdp.push_str(&format!("a=max-message-size:{}\r\n", SCTP_MAX_MESSAGE_SIZE));
    }
    sdp
}

fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Checking),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

/// Candidates that never arrived through the callback, read from the SDP instead
fn candidates_from_sdp(sdp: &str) -> Vec<CandidateInfo> {
    let mut mid: Option<String> = None;
    let mut m_line_index: Option<u16> = None;
    let mut candidates = Vec::new();

    for line in sdp.lines() {
        if line.starts_with("m=") {
            m_line_index = Some(m_line_index.map_or(0, |i| i + 1));
            mid = None;
        } else if let Some(value) = line.strip_prefix("a=mid:") {
            mid = Some(value.trim().to_string());
        } else if let Some(attr) = line.strip_prefix("a=").filter(|a| a.starts_with("candidate:")) {
            match CandidateInfo::parse(attr, mid.clone(), m_line_index) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => log::debug!("Skipping SDP candidate line: {}", e),
            }
        }
    }
    candidates
}

// ============================================================================
// Transport
// ============================================================================

/// Creates a fresh WebRTC peer connection per negotiation session
pub struct WebRtcTransport {
    api: API,
    ice: IceConfig,
}

impl WebRtcTransport {
    pub fn new(ice: IceConfig) -> Result<Self> {
        Ok(Self {
            api: build_api()?,
            ice,
        })
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    async fn create_session(&self, events: TransportEvents) -> Result<Box<dyn NegotiationSession>> {
        let config = RTCConfiguration {
            ice_servers: self.ice.ice_servers(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );
        log::debug!("Created peer connection for session {}", events.generation());

        Ok(Box::new(WebRtcPeer::new(peer_connection, events)))
    }
}

// ============================================================================
// WebRTC Peer Connection
// ============================================================================

/// Candidates discovered for the current local description
#[derive(Default)]
struct Gathered {
    candidates: Vec<CandidateInfo>,
}

/// One peer connection attempt
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    events: TransportEvents,
    gathered: Arc<Mutex<Gathered>>,
    gathering_done: watch::Sender<bool>,
    channel: Arc<Mutex<Option<Arc<RtcChannel>>>>,
}

impl WebRtcPeer {
    fn new(peer_connection: Arc<RTCPeerConnection>, events: TransportEvents) -> Self {
        let gathered = Arc::new(Mutex::new(Gathered::default()));
        let (gathering_done, _) = watch::channel(false);
        let channel: Arc<Mutex<Option<Arc<RtcChannel>>>> = Arc::new(Mutex::new(None));

        // ICE candidates; `None` marks the end of a gathering round
        let sink = gathered.clone();
        let done = gathering_done.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(init) => {
                        match CandidateInfo::parse(&init.candidate, init.sdp_mid, init.sdp_mline_index) {
                            Ok(info) => {
                                log::debug!("Local candidate: {} {}:{}", info.kind, info.address, info.port);
                                if let Ok(mut gathered) = sink.lock() {
                                    gathered.candidates.push(info);
                                }
                            }
                            Err(e) => log::debug!("Ignoring unparsable local candidate: {}", e),
                        }
                    }
                    Err(e) => log::warn!("Failed to serialize ICE candidate: {}", e),
                },
                None => {
                    done.send_replace(true);
                }
            }
            Box::pin(async {})
        }));

        // Connection state
        let state_events = events.clone();
        let weak_pc: Weak<RTCPeerConnection> = Arc::downgrade(&peer_connection);
        peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = state_events.clone();
            let weak_pc = weak_pc.clone();
            Box::pin(async move {
                log::debug!("Peer connection state: {}", state);
                if state == RTCPeerConnectionState::Connected {
                    if let Some(pc) = weak_pc.upgrade() {
                        // Stats are read outside the callback, which runs under the connection's locks
                        tokio::spawn(async move {
                            let info = connection_info(&pc).await;
                            eprintln!("WebRTC connection established!");
                            eprintln!("   Connection: {}", info.connection_type);
                            if let (Some(local), Some(remote)) = (&info.local_address, &info.remote_address) {
                                eprintln!("   Local: {} -> Remote: {}", local, remote);
                            }
                        });
                    }
                }
                if let Some(state) = map_state(state) {
                    events.emit(TransportEvent::ConnectionState(state));
                }
            })
        }));

        // Incoming data channel (answering side)
        let channel_events = events.clone();
        let slot = channel.clone();
        peer_connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            let slot = slot.clone();
            Box::pin(async move {
                if dc.label() != CHANNEL_LABEL {
                    log::warn!("Ignoring unexpected data channel '{}'", dc.label());
                    return;
                }
                let attached = RtcChannel::attach(dc, events).await;
                if let Ok(mut slot) = slot.lock() {
                    *slot = Some(attached);
                }
            })
        }));

        Self {
            peer_connection,
            events,
            gathered,
            gathering_done,
            channel,
        }
    }

    /// Forget candidates of the previous local description
    fn reset_gathering(&self) {
        if let Ok(mut gathered) = self.gathered.lock() {
            gathered.candidates.clear();
        }
        self.gathering_done.send_replace(false);
    }

    async fn apply_local(&self, description: RTCSessionDescription) -> Result<String> {
        self.reset_gathering();
        let sdp = description.sdp.clone();
        self.peer_connection
            .set_local_description(description)
            .await
            .context("Failed to set local description")?;
        Ok(advertise_max_message_size(sdp))
    }
}

#[async_trait]
impl NegotiationSession for WebRtcPeer {
    async fn create_channel(&self, label: &str) -> Result<()> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .peer_connection
            .create_data_channel(label, Some(init))
            .await
            .context("Failed to create data channel")?;
        log::debug!("Created data channel: {}", label);

        let attached = RtcChannel::attach(dc, self.events.clone()).await;
        if let Ok(mut slot) = self.channel.lock() {
            *slot = Some(attached);
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self
            .peer_connection
            .create_offer(Some(options))
            .await
            .context("Failed to create offer")?;
        self.apply_local(offer).await
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        self.apply_local(answer).await
    }

    async fn apply_remote_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_string()).context("Failed to parse offer SDP")?;
        self.peer_connection
            .set_remote_description(offer)
            .await
            .context("Failed to set remote offer")
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer =
            RTCSessionDescription::answer(sdp.to_string()).context("Failed to parse answer SDP")?;
        self.peer_connection
            .set_remote_description(answer)
            .await
            .context("Failed to set remote answer")
    }

    async fn add_remote_candidate(&self, candidate: &CandidatePayload) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .context("Failed to add ICE candidate")
    }

    async fn gather_candidates(&self, timeout: Duration) -> Vec<CandidateInfo> {
        let mut done = self.gathering_done.subscribe();
        let finished = tokio::time::timeout(timeout, done.wait_for(|complete| *complete))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);
        if !finished {
            log::debug!("ICE gathering still running after {:?}", timeout);
        }

        let candidates = self
            .gathered
            .lock()
            .map(|gathered| gathered.candidates.clone())
            .unwrap_or_default();
        if !candidates.is_empty() {
            return candidates;
        }

        match self.peer_connection.local_description().await {
            Some(local) => candidates_from_sdp(&local.sdp),
            None => Vec::new(),
        }
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut slot) = self.channel.lock() {
            slot.take();
        }
        self.peer_connection
            .close()
            .await
            .context("Failed to close peer connection")
    }
}

// ============================================================================
// Connection diagnostics
// ============================================================================

/// WebRTC connection information
#[derive(Debug, Clone)]
pub struct WebRtcConnectionInfo {
    pub connection_type: String,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
}

/// Get connection info (candidate type, addresses) of the nominated pair
async fn connection_info(peer_connection: &RTCPeerConnection) -> WebRtcConnectionInfo {
    let stats = peer_connection.get_stats().await;

    let mut local_candidate_type = None;
    let mut remote_candidate_type = None;
    let mut local_address = None;
    let mut remote_address = None;
    let mut nominated_pair_local_id = None;
    let mut nominated_pair_remote_id = None;

    for report in stats.reports.values() {
        if let StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                nominated_pair_local_id = Some(pair.local_candidate_id.clone());
                nominated_pair_remote_id = Some(pair.remote_candidate_id.clone());
                break;
            }
        }
    }

    for (id, report) in &stats.reports {
        match report {
            StatsReportType::LocalCandidate(candidate) if nominated_pair_local_id.as_ref() == Some(id) => {
                local_candidate_type = Some(format!("{:?}", candidate.candidate_type));
                local_address = Some(format!("{}:{}", candidate.ip, candidate.port));
            }
            StatsReportType::RemoteCandidate(candidate) if nominated_pair_remote_id.as_ref() == Some(id) => {
                remote_candidate_type = Some(format!("{:?}", candidate.candidate_type));
                remote_address = Some(format!("{}:{}", candidate.ip, candidate.port));
            }
            _ => {}
        }
    }

    WebRtcConnectionInfo {
        connection_type: describe_pair(local_candidate_type.as_deref(), remote_candidate_type.as_deref()),
        local_address,
        remote_address,
    }
}

fn describe_pair(local: Option<&str>, remote: Option<&str>) -> String {
    match (local, remote) {
        (Some(local), Some(remote)) => {
            let local_lower = local.to_lowercase();
            let remote_lower = remote.to_lowercase();
            if local_lower.contains("relay") || remote_lower.contains("relay") {
                "Relay (TURN)".to_string()
            } else if local_lower.contains("host") && remote_lower.contains("host") {
                "Direct (Host)".to_string()
            } else if local_lower.contains("srflx") || remote_lower.contains("srflx") {
                "Direct (STUN)".to_string()
            } else if local_lower.contains("prflx") || remote_lower.contains("prflx") {
                "Direct (Peer Reflexive)".to_string()
            } else {
                format!("Unknown ({}/{})", local, remote)
            }
        }
        _ => "Unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_common::signaling::CandidateType;

    #[test]
    fn test_ice_servers_include_turn_credentials() {
        let config = IceConfig {
            stun_urls: vec!["stun:stun.example.org:3478".to_string()],
            turn: Some(TurnServer {
                url: "turn:turn.example.org:3478".to_string(),
                username: "alice".to_string(),
                credential: "secret".to_string(),
            }),
        };

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert_eq!(servers[1].username, "alice");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn test_no_stun_means_host_only() {
        let config = IceConfig {
            stun_urls: Vec::new(),
            turn: None,
        };
        assert!(config.ice_servers().is_empty());
    }

    #[test]
    fn test_max_message_size_advertised_once() {
        let sdp = advertise_max_message_size("v=0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n".to_string());
        assert!(sdp.ends_with("a=max-message-size:1048576\r\n"));
        assert_eq!(advertise_max_message_size(sdp.clone()), sdp);
    }

    #[test]
    fn test_candidates_from_sdp() {
        let sdp = "v=0\r\n\
                   m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
                   a=mid:0\r\n\
                   a=candidate:1 1 udp 2130706431 192.168.1.20 50000 typ host\r\n\
                   a=candidate:2 1 udp 1694498815 203.0.113.7 61000 typ srflx raddr 192.168.1.20 rport 50000\r\n";

        let candidates = candidates_from_sdp(sdp);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].kind, CandidateType::Host);
        assert_eq!(candidates[1].kind, CandidateType::ServerReflexive);
        assert_eq!(candidates[1].address, "203.0.113.7");
        assert_eq!(candidates[1].sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidates[1].sdp_m_line_index, Some(0));
        assert!(candidates[0].raw.starts_with("candidate:"));
    }

    #[test]
    fn test_describe_pair() {
        assert_eq!(describe_pair(Some("Host"), Some("Host")), "Direct (Host)");
        assert_eq!(describe_pair(Some("Srflx"), Some("Host")), "Direct (STUN)");
        assert_eq!(describe_pair(Some("Relay"), Some("Srflx")), "Relay (TURN)");
        assert_eq!(describe_pair(None, Some("Host")), "Unknown");
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state(RTCPeerConnectionState::Connecting), Some(TransportState::Checking));
        assert_eq!(map_state(RTCPeerConnectionState::Failed), Some(TransportState::Failed));
        assert_eq!(map_state(RTCPeerConnectionState::Unspecified), None);
    }
}
