//! Transport negotiation capability.
//!
//! One [`NegotiationSession`] corresponds to one peer connection attempt.
//! Everything the session observes asynchronously (connection state, the
//! data channel opening, frames, closure) is reported through the
//! [`TransportEvents`] it was created with, tagged with the session's
//! generation so the coordinator can ignore superseded sessions.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::transfer::{ChannelMessage, DataChannel};
use crate::signaling::candidate::{CandidateInfo, CandidatePayload};

/// Label of the single data channel carrying file frames
pub const CHANNEL_LABEL: &str = "file-transfer";

/// Connectivity of the negotiated transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Checking => "checking",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub enum TransportEvent {
    ConnectionState(TransportState),
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelMessage(ChannelMessage),
    ChannelClosed,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            TransportEvent::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            TransportEvent::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
            TransportEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

type EventSink = dyn Fn(u64, TransportEvent) + Send + Sync;

/// Where a negotiation session reports what it observes
#[derive(Clone)]
pub struct TransportEvents {
    generation: u64,
    sink: Arc<EventSink>,
}

impl TransportEvents {
    pub fn new(generation: u64, sink: impl Fn(u64, TransportEvent) + Send + Sync + 'static) -> Self {
        Self {
            generation,
            sink: Arc::new(sink),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        (self.sink)(self.generation, event);
    }
}

impl fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEvents")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Factory for negotiation sessions
#[async_trait]
pub trait Transport: Send + Sync {
    async fn create_session(&self, events: TransportEvents) -> Result<Box<dyn NegotiationSession>>;
}

/// One peer connection being (re)negotiated.
#[async_trait]
pub trait NegotiationSession: Send + Sync {
    /// Create the outbound ordered, reliable channel (offering side)
    async fn create_channel(&self, label: &str) -> Result<()>;

    /// Generate an offer and apply it locally. Returns the SDP.
    async fn create_offer(&self, ice_restart: bool) -> Result<String>;

    /// Generate an answer to the applied remote offer and apply it locally
    async fn create_answer(&self) -> Result<String>;

    async fn apply_remote_offer(&self, sdp: &str) -> Result<()>;

    async fn apply_remote_answer(&self, sdp: &str) -> Result<()>;

    async fn add_remote_candidate(&self, candidate: &CandidatePayload) -> Result<()>;

    /// Wait for local candidate discovery to complete or `timeout` to pass,
    /// returning every candidate found for the current local description.
    async fn gather_candidates(&self, timeout: Duration) -> Vec<CandidateInfo>;

    async fn close(&self) -> Result<()>;
}
