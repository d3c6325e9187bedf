//! Session coordination: turns signaling traffic and transport callbacks
//! into a negotiated channel, then drives transfers over it.
//!
//! All state lives in a single coordinator task (see [`spawn_session`]).
//! Callers talk to it through a cloneable [`SessionHandle`] and observe it
//! through [`SessionUpdate`]s and [`SessionSnapshot`]s.

mod coordinator;
pub mod transport;

use anyhow::{Context, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::core::receive::ReceiveEvent;
use crate::core::sink::{DiskTarget, ReceivedFile, SinkKind};
use crate::core::transfer::{FileMeta, FileSource, TransferProgress, DEFAULT_CHUNK_SIZE};
use crate::nat::NatCategory;
use crate::signaling::candidate::CandidatePayload;
use crate::signaling::envelope::PeerIdentity;
use crate::signaling::relay::{RelayConnectionState, SignalRelay};

use coordinator::{Coordinator, Event};
pub use transport::{
    NegotiationSession, Transport, TransportEvent, TransportEvents, TransportState, CHANNEL_LABEL,
};

/// Automatic restarts allowed before the session is declared failed
pub const MAX_RESTARTS: u32 = 5;

/// Upper bound on local candidate discovery per negotiation attempt
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a "disconnected" transport may linger before it counts as lost
pub const DISCONNECT_GRACE: Duration = Duration::from_secs(3);

/// A published offer, answer or join must lead to a connection within this window
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Originates offers and sends the file
    Sender,
    /// Joins, answers and owns the receive sink
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPhase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionPhase::Idle => "idle",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Negotiation state, owned by the coordinator task
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub phase: ConnectionPhase,
    pub negotiation_attempt: u32,
    pub target_peer: Option<PeerIdentity>,
    /// Candidates that arrived before a remote description existed
    pub pending_remote_candidates: Vec<(PeerIdentity, CandidatePayload)>,
}

/// Read-only copy of the coordinator's state, published after every event
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub phase: ConnectionPhase,
    pub negotiation_attempt: u32,
    pub target_peer: Option<PeerIdentity>,
    pub pending_candidates: usize,
    pub nat: NatCategory,
    pub relay: RelayConnectionState,
    pub outbound: TransferProgress,
    pub inbound: TransferProgress,
}

/// User-facing notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Phase(ConnectionPhase),
    Status(String),
    NatDetected(NatCategory),
    RelayState(RelayConnectionState),
    /// Data channel open and transport connected
    ChannelReady,
    /// Receiver reported its channel open
    PeerReady,
    SendProgress(TransferProgress),
    SendComplete(FileMeta),
    ReceiveStarted { meta: FileMeta, sink: SinkKind },
    ReceiveProgress(TransferProgress),
    FileReceived(ReceivedFile),
    TransferFailed { reason: String, retryable: bool },
    /// Terminal until an explicit reconnect
    SessionFailed { reason: String },
}

impl From<ReceiveEvent> for SessionUpdate {
    fn from(event: ReceiveEvent) -> Self {
        match event {
            ReceiveEvent::Started { meta, sink } => SessionUpdate::ReceiveStarted { meta, sink },
            ReceiveEvent::Progress(progress) => SessionUpdate::ReceiveProgress(progress),
            ReceiveEvent::Completed(file) => SessionUpdate::FileReceived(file),
        }
    }
}

pub struct SessionConfig {
    pub role: Role,
    pub identity: PeerIdentity,
    pub chunk_size: usize,
    /// Write incoming files through `disk_target` when one is available
    pub prefer_disk: bool,
    pub disk_target: Option<Arc<dyn DiskTarget>>,
    /// Publish an `ice-batch` after every offer/answer in addition to the inline candidates
    pub redundant_candidate_batch: bool,
}

impl SessionConfig {
    pub fn new(role: Role, identity: PeerIdentity) -> Self {
        Self {
            role,
            identity,
            chunk_size: DEFAULT_CHUNK_SIZE,
            prefer_disk: false,
            disk_target: None,
            redundant_candidate_batch: true,
        }
    }

    pub fn with_disk_target(mut self, target: Arc<dyn DiskTarget>) -> Self {
        self.disk_target = Some(target);
        self.prefer_disk = true;
        self
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("role", &self.role)
            .field("identity", &self.identity)
            .field("chunk_size", &self.chunk_size)
            .field("prefer_disk", &self.prefer_disk)
            .field("has_disk_target", &self.disk_target.is_some())
            .field("redundant_candidate_batch", &self.redundant_candidate_batch)
            .finish()
    }
}

pub(crate) enum Command {
    Start,
    SendFile(FileSource),
    Reconnect,
    Reset(oneshot::Sender<()>),
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Stops the coordinator once the last handle is gone
struct HandleGuard {
    tx: mpsc::UnboundedSender<Event>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Event::Command(Command::Shutdown(None)));
    }
}

/// Cloneable handle to a running coordinator
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Event>,
    snapshots: watch::Receiver<SessionSnapshot>,
    _guard: Arc<HandleGuard>,
}

impl SessionHandle {
    fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(Event::Command(command))
            .ok()
            .context("Session coordinator has stopped")
    }

    /// Sender: open the room and wait for a joiner. Receiver: join the room.
    pub fn start(&self) -> Result<()> {
        self.command(Command::Start)
    }

    /// Queue a file for sending once connected
    pub fn send_file(&self, source: FileSource) -> Result<()> {
        self.command(Command::SendFile(source))
    }

    /// Leave Failed (or Idle) and negotiate again
    pub fn reconnect(&self) -> Result<()> {
        self.command(Command::Reconnect)
    }

    /// Tear everything down and return to Idle
    pub async fn reset(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Reset(tx))?;
        rx.await.context("Session coordinator stopped during reset")
    }

    /// Tear down and stop the coordinator task
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Shutdown(Some(tx)))?;
        rx.await.context("Session coordinator stopped during shutdown")
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }
}

/// Start the coordinator task.
///
/// Nothing happens on the network until [`SessionHandle::start`] is called.
pub fn spawn_session(
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    relay: Arc<dyn SignalRelay>,
) -> (
    SessionHandle,
    mpsc::UnboundedReceiver<SessionUpdate>,
    JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

    let coordinator = Coordinator::new(config, transport, relay, tx.clone(), updates_tx, snapshot_tx);
    let task = tokio::spawn(coordinator.run(rx));

    let handle = SessionHandle {
        tx: tx.clone(),
        snapshots: snapshot_rx,
        _guard: Arc::new(HandleGuard { tx }),
    };
    (handle, updates_rx, task)
}
