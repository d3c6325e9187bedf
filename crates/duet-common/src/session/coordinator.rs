//! The coordinator task.
//!
//! Owns [`SessionState`] and every live resource (negotiation session, data
//! channel, sinks, timers). Relay deliveries, transport callbacks, timers and
//! the outbound send task only post [`Event`]s; handlers run one at a time.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::transport::{NegotiationSession, Transport, TransportEvent, TransportEvents, TransportState, CHANNEL_LABEL};
use super::{
    Command, ConnectionPhase, Role, SessionConfig, SessionSnapshot, SessionState, SessionUpdate,
    DISCONNECT_GRACE, DISCOVERY_TIMEOUT, MAX_RESTARTS, NEGOTIATION_TIMEOUT,
};
use crate::core::receive::TransferReceiver;
use crate::core::transfer::{
    send_file, ChannelMessage, DataChannel, FileMeta, FileSource, TransferError, TransferPhase,
    TransferProgress,
};
use crate::nat::{self, NatCategory};
use crate::signaling::candidate::{CandidateInfo, CandidatePayload};
use crate::signaling::envelope::{DescriptionPayload, PeerIdentity, SignalEnvelope, SignalKind};
use crate::signaling::relay::{InboundSignal, RelayAdapter, RelayConnectionState, SignalRelay};

pub(crate) enum Event {
    Command(Command),
    Relay(InboundSignal),
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    Timer {
        kind: TimerKind,
        id: u64,
    },
    SendProgress {
        transfer: u64,
        progress: TransferProgress,
    },
    SendFinished {
        transfer: u64,
        result: Result<FileMeta, TransferError>,
    },
}

impl From<InboundSignal> for Event {
    fn from(signal: InboundSignal) -> Self {
        Event::Relay(signal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    DisconnectGrace,
    Restart,
    Negotiation,
}

/// One-shot timers that post tagged events back into the queue
#[derive(Default)]
struct Timers {
    next_id: u64,
    armed: HashMap<TimerKind, (u64, JoinHandle<()>)>,
}

impl Timers {
    fn arm(&mut self, kind: TimerKind, delay: Duration, queue: &mpsc::UnboundedSender<Event>) {
        self.cancel(kind);
        self.next_id += 1;
        let id = self.next_id;
        let queue = queue.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = queue.send(Event::Timer { kind, id });
        });
        self.armed.insert(kind, (id, task));
    }

    fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, task)) = self.armed.remove(&kind) {
            task.abort();
        }
    }

    fn cancel_all(&mut self) {
        for (_, (_, task)) in self.armed.drain() {
            task.abort();
        }
    }

    fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Disarm and return true if `id` is the live timer for `kind`
    fn take_fired(&mut self, kind: TimerKind, id: u64) -> bool {
        match self.armed.get(&kind) {
            Some((live, _)) if *live == id => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

struct Outbound {
    id: u64,
    task: JoinHandle<()>,
}

/// Transfer errors that leave the session unusable.
///
/// A peer protocol violation only ends the transfer; the channel is still
/// good for a resend.
fn fails_session(err: &TransferError) -> bool {
    !matches!(
        err,
        TransferError::EmptyFile
            | TransferError::InvalidChunkSize(_)
            | TransferError::Source(_)
            | TransferError::Protocol(_)
    )
}

pub(crate) struct Coordinator {
    role: Role,
    identity: PeerIdentity,
    chunk_size: usize,
    redundant_batch: bool,
    transport: Arc<dyn Transport>,
    relay: RelayAdapter,
    queue: mpsc::UnboundedSender<Event>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    snapshots: watch::Sender<SessionSnapshot>,

    state: SessionState,
    generation: u64,
    session: Option<Box<dyn NegotiationSession>>,
    channel: Option<Arc<dyn DataChannel>>,
    transport_connected: bool,
    has_remote_description: bool,
    awaiting_answer: bool,
    /// The next sender-side restart builds a new session instead of restarting ICE
    needs_fresh_session: bool,
    /// Sender: last published offer, republished when the receiver prompts again
    last_offer: Option<SignalEnvelope>,
    /// Receiver: SDP of the last applied offer
    last_applied_offer: Option<String>,
    nat: NatCategory,
    relay_state: RelayConnectionState,

    receiver: TransferReceiver,
    outbound: Option<Outbound>,
    outbound_progress: TransferProgress,
    next_transfer_id: u64,
    timers: Timers,
}

impl Coordinator {
    pub(crate) fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        relay: Arc<dyn SignalRelay>,
        queue: mpsc::UnboundedSender<Event>,
        updates: mpsc::UnboundedSender<SessionUpdate>,
        snapshots: watch::Sender<SessionSnapshot>,
    ) -> Self {
        Self {
            role: config.role,
            identity: config.identity,
            chunk_size: config.chunk_size,
            redundant_batch: config.redundant_candidate_batch,
            transport,
            relay: RelayAdapter::new(relay),
            queue,
            updates,
            snapshots,
            state: SessionState::default(),
            generation: 0,
            session: None,
            channel: None,
            transport_connected: false,
            has_remote_description: false,
            awaiting_answer: false,
            needs_fresh_session: false,
            last_offer: None,
            last_applied_offer: None,
            nat: NatCategory::Unknown,
            relay_state: RelayConnectionState::default(),
            receiver: TransferReceiver::new(config.disk_target, config.prefer_disk),
            outbound: None,
            outbound_progress: TransferProgress::default(),
            next_transfer_id: 0,
            timers: Timers::default(),
        }
    }

    pub(crate) async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        log::debug!("Session coordinator started as {} ({})", self.role, self.identity);
        while let Some(event) = events.recv().await {
            let keep_running = self.handle(event).await;
            self.publish_snapshot();
            if !keep_running {
                break;
            }
        }
        log::debug!("Session coordinator stopped");
    }

    async fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Command(command) => return self.on_command(command).await,
            Event::Relay(InboundSignal::Envelope(raw)) => self.on_envelope(&raw).await,
            Event::Relay(InboundSignal::State(state)) => self.on_relay_state(state).await,
            Event::Transport { generation, event } => {
                if generation != self.generation || self.session.is_none() {
                    log::debug!("Dropping {:?} from superseded session {}", event, generation);
                } else {
                    self.on_transport(event).await;
                }
            }
            Event::Timer { kind, id } => {
                if self.timers.take_fired(kind, id) {
                    self.on_timer(kind).await;
                }
            }
            Event::SendProgress { transfer, progress } => {
                if self.is_current_transfer(transfer) {
                    self.outbound_progress = progress;
                    self.emit(SessionUpdate::SendProgress(progress));
                }
            }
            Event::SendFinished { transfer, result } => {
                if self.is_current_transfer(transfer) {
                    self.on_send_finished(result).await;
                }
            }
        }
        true
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn status(&self, message: impl Into<String>) {
        let message = message.into();
        log::debug!("Status: {}", message);
        self.emit(SessionUpdate::Status(message));
    }

    fn set_phase(&mut self, phase: ConnectionPhase) {
        if self.state.phase != phase {
            log::debug!("Phase {} -> {}", self.state.phase, phase);
            self.state.phase = phase;
            self.emit(SessionUpdate::Phase(phase));
        }
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(SessionSnapshot {
            phase: self.state.phase,
            negotiation_attempt: self.state.negotiation_attempt,
            target_peer: self.state.target_peer.clone(),
            pending_candidates: self.state.pending_remote_candidates.len(),
            nat: self.nat,
            relay: self.relay_state,
            outbound: self.outbound_progress,
            inbound: self.receiver.progress(),
        });
    }

    fn session(&self) -> Result<&dyn NegotiationSession> {
        self.session.as_deref().context("No active transport session")
    }

    fn is_target(&self, peer: &PeerIdentity) -> bool {
        self.state.target_peer.as_ref() == Some(peer)
    }

    fn is_current_transfer(&self, id: u64) -> bool {
        self.outbound.as_ref().map(|o| o.id) == Some(id)
    }

    fn is_negotiating(&self) -> bool {
        matches!(
            self.state.phase,
            ConnectionPhase::Connecting | ConnectionPhase::Connected
        )
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start => self.start().await,
            Command::SendFile(source) => self.start_send(source),
            Command::Reconnect => self.reconnect().await,
            Command::Reset(ack) => {
                self.teardown().await;
                let _ = ack.send(());
            }
            Command::Shutdown(ack) => {
                self.teardown().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return false;
            }
        }
        true
    }

    async fn start(&mut self) {
        if self.state.phase != ConnectionPhase::Idle {
            self.status(format!("Session is already {}", self.state.phase));
            return;
        }
        if let Err(e) = self.relay.attach(self.queue.clone()).await {
            self.fail(format!("Signaling relay unreachable: {:#}", e)).await;
            return;
        }

        self.set_phase(ConnectionPhase::Connecting);
        match self.role {
            Role::Sender => self.status("Waiting for the receiver to join"),
            Role::Receiver => self.request_offer().await,
        }
    }

    async fn reconnect(&mut self) {
        match self.state.phase {
            ConnectionPhase::Idle => self.start().await,
            ConnectionPhase::Failed => {
                if let Err(e) = self.relay.attach(self.queue.clone()).await {
                    self.fail(format!("Signaling relay unreachable: {:#}", e)).await;
                    return;
                }
                self.state.negotiation_attempt = 0;
                self.set_phase(ConnectionPhase::Connecting);
                match self.role {
                    Role::Sender if self.state.target_peer.is_some() => {
                        self.status("Reconnecting to the receiver");
                        self.start_offer(true).await;
                    }
                    Role::Sender => self.status("Waiting for the receiver to join"),
                    Role::Receiver => self.request_offer().await,
                }
            }
            phase => self.status(format!("Session is already {}", phase)),
        }
    }

    fn start_send(&mut self, source: FileSource) {
        if self.role != Role::Sender {
            self.emit(SessionUpdate::TransferFailed {
                reason: "Only the sending side can send files".to_string(),
                retryable: false,
            });
            return;
        }
        if self.outbound.is_some() {
            self.emit(SessionUpdate::TransferFailed {
                reason: "A transfer is already in progress".to_string(),
                retryable: true,
            });
            return;
        }
        let channel = match (&self.channel, self.state.phase) {
            (Some(channel), ConnectionPhase::Connected) => channel.clone(),
            _ => {
                self.emit(SessionUpdate::TransferFailed {
                    reason: "Not connected to a receiver".to_string(),
                    retryable: true,
                });
                return;
            }
        };

        self.next_transfer_id += 1;
        let id = self.next_transfer_id;
        let queue = self.queue.clone();
        let chunk_size = self.chunk_size;
        self.outbound_progress = TransferProgress::started(source.size);

        log::debug!("Starting transfer {} of {}", id, source.name);
        let task = tokio::spawn(async move {
            let progress_queue = queue.clone();
            let result = send_file(channel.as_ref(), source, chunk_size, move |progress| {
                let _ = progress_queue.send(Event::SendProgress {
                    transfer: id,
                    progress,
                });
            })
            .await;
            let _ = queue.send(Event::SendFinished {
                transfer: id,
                result,
            });
        });
        self.outbound = Some(Outbound { id, task });
    }

    async fn on_send_finished(&mut self, result: Result<FileMeta, TransferError>) {
        self.outbound = None;
        match result {
            Ok(meta) => {
                self.outbound_progress.phase = TransferPhase::Complete;
                self.emit(SessionUpdate::SendComplete(meta));
            }
            Err(e) => {
                self.outbound_progress.phase = TransferPhase::Failed;
                self.on_transfer_error(e).await;
            }
        }
    }

    async fn on_transfer_error(&mut self, err: TransferError) {
        let reason = err.to_string();
        log::warn!("Transfer failed: {}", reason);
        self.emit(SessionUpdate::TransferFailed {
            reason: reason.clone(),
            retryable: err.is_retryable(),
        });
        if fails_session(&err) {
            self.fail(format!("Transfer failed: {}", reason)).await;
        }
    }

    // ========================================================================
    // Signaling
    // ========================================================================

    async fn on_envelope(&mut self, raw: &str) {
        let envelope = match SignalEnvelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("{:#}", e);
                self.status("Ignored a malformed signaling message");
                return;
            }
        };
        if !envelope.is_for(&self.identity) {
            log::trace!("Ignoring '{}' from {}", envelope.kind.as_str(), envelope.from);
            return;
        }
        if self.state.phase == ConnectionPhase::Idle {
            log::debug!("Ignoring '{}' while idle", envelope.kind.as_str());
            return;
        }

        let from = envelope.from.clone();
        match (envelope.kind, self.role) {
            (SignalKind::Join, Role::Sender) => self.on_join(from, envelope.to.is_some()).await,
            (SignalKind::Offer, Role::Receiver) => match envelope.description() {
                Ok(desc) => self.on_offer(from, desc).await,
                Err(e) => self.malformed(e),
            },
            (SignalKind::Answer, Role::Sender) => match envelope.description() {
                Ok(desc) => self.on_answer(from, desc).await,
                Err(e) => self.malformed(e),
            },
            (SignalKind::Ice | SignalKind::IceBatch, _) => match envelope.candidates() {
                Ok(candidates) => self.on_remote_candidates(from, candidates).await,
                Err(e) => self.malformed(e),
            },
            (SignalKind::Ready, Role::Sender) if self.is_target(&from) => {
                self.emit(SessionUpdate::PeerReady);
                self.status("Receiver is ready");
            }
            (kind, role) => log::debug!("Ignoring '{}' as {}", kind.as_str(), role),
        }
    }

    fn malformed(&self, err: anyhow::Error) {
        log::warn!("{:#}", err);
        self.status("Ignored a malformed signaling message");
    }

    async fn on_relay_state(&mut self, state: RelayConnectionState) {
        if state == self.relay_state {
            return;
        }
        log::debug!("Relay {} -> {}", self.relay_state, state);
        self.relay_state = state;
        self.emit(SessionUpdate::RelayState(state));

        match state {
            RelayConnectionState::Failed if self.state.phase == ConnectionPhase::Connecting => {
                // Nothing can be negotiated without the relay
                self.fail("Signaling relay unreachable".to_string()).await;
            }
            RelayConnectionState::Disconnected | RelayConnectionState::Suspended => {
                self.status(format!("Signaling relay {}; waiting for it to come back", state));
            }
            _ => {}
        }
    }

    /// Sender: a receiver joined, or asked the current session to restart
    async fn on_join(&mut self, from: PeerIdentity, addressed: bool) {
        if self.state.phase == ConnectionPhase::Failed {
            self.status("Receiver asked to reconnect; reconnect to continue");
            return;
        }

        if self.is_target(&from) && self.session.is_some() {
            if !addressed {
                log::debug!("Duplicate join from {}", from);
                return;
            }
            if self.awaiting_answer {
                if let Some(offer) = self.last_offer.clone() {
                    log::debug!("Receiver prompted again; republishing the pending offer");
                    if let Err(e) = self.relay.publish(&offer).await {
                        log::warn!("{:#}", e);
                    }
                }
                return;
            }
            if self.timers.is_armed(TimerKind::Restart) {
                log::debug!("Restart already scheduled");
                return;
            }
            self.status("Receiver asked to restart the connection");
            self.set_phase(ConnectionPhase::Connecting);
            let fresh = self.needs_fresh_session;
            self.start_offer(fresh).await;
            return;
        }

        if self.state.phase == ConnectionPhase::Connected {
            log::warn!("Ignoring join from {} while connected", from);
            return;
        }

        self.status(format!("Receiver {} joined", from));
        self.state.target_peer = Some(from);
        self.state.negotiation_attempt = 0;
        self.start_offer(true).await;
    }

    async fn start_offer(&mut self, fresh: bool) {
        if let Err(e) = self.publish_offer(fresh).await {
            log::warn!("Offer failed: {:#}", e);
            self.on_loss(format!("negotiation error: {:#}", e)).await;
        }
    }

    async fn publish_offer(&mut self, fresh: bool) -> Result<()> {
        let target = self
            .state
            .target_peer
            .clone()
            .context("No receiver to offer to")?;
        let ice_restart = !fresh && self.session.is_some();

        if !ice_restart {
            self.replace_session().await?;
            self.session()?
                .create_channel(CHANNEL_LABEL)
                .await
                .context("Failed to create data channel")?;
        }

        let sdp = self
            .session()?
            .create_offer(ice_restart)
            .await
            .context("Failed to create offer")?;
        self.has_remote_description = false;
        self.awaiting_answer = true;

        let candidates = self.discover_candidates().await?;
        let payload = DescriptionPayload {
            sdp,
            sdp_type: "offer".to_string(),
            candidates: candidates.clone(),
            ice_restart,
        };
        let envelope = SignalEnvelope::offer(&self.identity, &target, &payload)?;
        self.relay.publish(&envelope).await?;
        self.last_offer = Some(envelope);
        self.publish_batch(&target, &candidates).await;

        self.timers
            .arm(TimerKind::Negotiation, NEGOTIATION_TIMEOUT, &self.queue);
        self.status(if ice_restart {
            "Sent ICE restart offer"
        } else {
            "Sent offer, waiting for answer"
        });
        Ok(())
    }

    /// Receiver: an offer arrived
    async fn on_offer(&mut self, from: PeerIdentity, desc: DescriptionPayload) {
        if self.state.phase == ConnectionPhase::Failed {
            self.status("Sender is reconnecting; reconnect to continue");
            return;
        }
        if let Some(target) = &self.state.target_peer {
            if *target != from && self.state.phase == ConnectionPhase::Connected {
                log::warn!("Ignoring offer from {} while connected to {}", from, target);
                return;
            }
        }
        if self.last_applied_offer.as_deref() == Some(desc.sdp.as_str()) {
            log::debug!("Duplicate offer from {}", from);
            return;
        }

        if let Err(e) = self.answer_offer(from, desc).await {
            log::warn!("Answer failed: {:#}", e);
            self.on_loss(format!("negotiation error: {:#}", e)).await;
        }
    }

    async fn answer_offer(&mut self, from: PeerIdentity, desc: DescriptionPayload) -> Result<()> {
        let same_peer = self.is_target(&from);
        let ice_restart = desc.ice_restart && same_peer && self.session.is_some();
        if !same_peer {
            self.state.negotiation_attempt = 0;
        }
        self.state.target_peer = Some(from.clone());

        if !ice_restart {
            // Candidates may have overtaken the offer on the relay
            let queued = std::mem::take(&mut self.state.pending_remote_candidates);
            self.replace_session().await?;
            self.state.pending_remote_candidates = queued;
        }

        self.session()?
            .apply_remote_offer(&desc.sdp)
            .await
            .context("Failed to apply remote offer")?;
        self.has_remote_description = true;
        self.last_applied_offer = Some(desc.sdp);
        self.add_remote_candidates(&from, desc.candidates).await;
        self.flush_pending_candidates().await;

        let sdp = self
            .session()?
            .create_answer()
            .await
            .context("Failed to create answer")?;
        let candidates = self.discover_candidates().await?;
        let payload = DescriptionPayload {
            sdp,
            sdp_type: "answer".to_string(),
            candidates: candidates.clone(),
            ice_restart,
        };
        self.relay
            .publish(&SignalEnvelope::answer(&self.identity, &from, &payload)?)
            .await?;
        self.publish_batch(&from, &candidates).await;

        self.set_phase(ConnectionPhase::Connecting);
        self.timers
            .arm(TimerKind::Negotiation, NEGOTIATION_TIMEOUT, &self.queue);
        self.status("Sent answer, connecting");
        self.maybe_connected();
        Ok(())
    }

    /// Sender: an answer arrived
    async fn on_answer(&mut self, from: PeerIdentity, desc: DescriptionPayload) {
        if !self.awaiting_answer || !self.is_target(&from) {
            log::debug!("Dropping stale answer from {}", from);
            return;
        }
        if let Err(e) = self.accept_answer(&from, desc).await {
            log::warn!("Applying answer failed: {:#}", e);
            self.on_loss(format!("negotiation error: {:#}", e)).await;
        }
    }

    async fn accept_answer(&mut self, from: &PeerIdentity, desc: DescriptionPayload) -> Result<()> {
        self.session()?
            .apply_remote_answer(&desc.sdp)
            .await
            .context("Failed to apply remote answer")?;
        self.awaiting_answer = false;
        self.has_remote_description = true;
        self.add_remote_candidates(from, desc.candidates).await;
        self.flush_pending_candidates().await;
        self.status("Answer received, connecting");
        self.maybe_connected();
        Ok(())
    }

    async fn on_remote_candidates(&mut self, from: PeerIdentity, candidates: Vec<CandidatePayload>) {
        match &self.state.target_peer {
            Some(target) if *target != from => {
                log::debug!("Dropping candidates from {} (not the current peer)", from);
                return;
            }
            None if self.role == Role::Sender => {
                log::debug!("Dropping candidates from {} before any join", from);
                return;
            }
            _ => {}
        }
        self.add_remote_candidates(&from, candidates).await;
    }

    /// Apply now if a remote description exists, otherwise queue
    async fn add_remote_candidates(&mut self, from: &PeerIdentity, candidates: Vec<CandidatePayload>) {
        if self.has_remote_description && self.session.is_some() {
            for candidate in &candidates {
                self.apply_candidate(candidate).await;
            }
        } else {
            log::debug!("Queueing {} candidate(s) from {}", candidates.len(), from);
            self.state
                .pending_remote_candidates
                .extend(candidates.into_iter().map(|c| (from.clone(), c)));
        }
    }

    async fn flush_pending_candidates(&mut self) {
        let pending = std::mem::take(&mut self.state.pending_remote_candidates);
        for (from, candidate) in pending {
            if self.is_target(&from) {
                self.apply_candidate(&candidate).await;
            } else {
                log::debug!("Discarding queued candidate from {}", from);
            }
        }
    }

    async fn apply_candidate(&self, candidate: &CandidatePayload) {
        if let Some(session) = &self.session {
            // Stale or unparsable candidates are expected around restarts
            if let Err(e) = session.add_remote_candidate(candidate).await {
                log::debug!("Ignoring remote candidate: {:#}", e);
            }
        }
    }

    /// Wait for local discovery, classify, and return the candidates to advertise
    async fn discover_candidates(&mut self) -> Result<Vec<CandidatePayload>> {
        let candidates = self.session()?.gather_candidates(DISCOVERY_TIMEOUT).await;
        for candidate in &candidates {
            log::debug!("Local candidate: {}", candidate);
        }

        let category = nat::classify(&candidates);
        if category != self.nat {
            self.nat = category;
            self.emit(SessionUpdate::NatDetected(category));
        }
        Ok(candidates.iter().map(CandidateInfo::to_payload).collect())
    }

    async fn publish_batch(&self, to: &PeerIdentity, candidates: &[CandidatePayload]) {
        if !self.redundant_batch || candidates.is_empty() {
            return;
        }
        let result = match SignalEnvelope::ice_batch(&self.identity, to, candidates) {
            Ok(envelope) => self.relay.publish(&envelope).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            log::warn!("Redundant candidate batch not sent: {:#}", e);
        }
    }

    /// Receiver: ask the sender for a (new) offer
    async fn request_offer(&mut self) {
        let join = SignalEnvelope::join(&self.identity, self.state.target_peer.as_ref());
        match self.relay.publish(&join).await {
            Ok(()) => {
                self.timers
                    .arm(TimerKind::Negotiation, NEGOTIATION_TIMEOUT, &self.queue);
                self.status(if self.state.target_peer.is_some() {
                    "Asked the sender to restart the connection"
                } else {
                    "Joined room, waiting for an offer"
                });
            }
            Err(e) => {
                log::warn!("{:#}", e);
                self.on_loss("could not reach the signaling relay").await;
            }
        }
    }

    // ========================================================================
    // Transport
    // ========================================================================

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionState(state) => self.on_transport_state(state).await,
            TransportEvent::ChannelOpen(channel) => {
                log::debug!("Data channel '{}' open", channel.label());
                self.channel = Some(channel);
                if self.role == Role::Receiver {
                    if let Some(target) = self.state.target_peer.clone() {
                        let ready = SignalEnvelope::ready(&self.identity, &target);
                        if let Err(e) = self.relay.publish(&ready).await {
                            log::warn!("{:#}", e);
                        }
                    }
                }
                self.maybe_connected();
            }
            TransportEvent::ChannelMessage(message) => self.on_channel_message(message).await,
            TransportEvent::ChannelClosed => {
                log::debug!("Data channel closed");
                self.channel = None;
                if self.receiver.is_active() {
                    self.receiver.abort().await;
                    self.emit(SessionUpdate::TransferFailed {
                        reason: TransferError::ChannelClosed.to_string(),
                        retryable: true,
                    });
                }
                if self.state.phase == ConnectionPhase::Connected {
                    self.needs_fresh_session = true;
                    self.on_loss("data channel closed").await;
                }
            }
        }
    }

    async fn on_transport_state(&mut self, state: TransportState) {
        log::debug!("Transport {}", state);
        match state {
            TransportState::Connected => {
                self.transport_connected = true;
                self.timers.cancel(TimerKind::DisconnectGrace);
                self.maybe_connected();
            }
            TransportState::Disconnected => {
                self.transport_connected = false;
                if self.is_negotiating() && !self.timers.is_armed(TimerKind::DisconnectGrace) {
                    self.status("Connection interrupted, waiting for it to recover");
                    self.timers
                        .arm(TimerKind::DisconnectGrace, DISCONNECT_GRACE, &self.queue);
                }
            }
            TransportState::Failed => {
                self.transport_connected = false;
                self.needs_fresh_session = true;
                self.on_loss("transport failed").await;
            }
            TransportState::Closed => {
                self.transport_connected = false;
                if self.state.phase == ConnectionPhase::Connected {
                    self.needs_fresh_session = true;
                    self.on_loss("transport closed").await;
                }
            }
            TransportState::New | TransportState::Checking => {}
        }
    }

    async fn on_channel_message(&mut self, message: ChannelMessage) {
        if self.role == Role::Sender {
            log::debug!("Ignoring inbound frame on the sending side");
            return;
        }
        match self.receiver.handle_message(message).await {
            Ok(Some(event)) => self.emit(event.into()),
            Ok(None) => {}
            Err(e) => self.on_transfer_error(e).await,
        }
    }

    fn maybe_connected(&mut self) {
        if self.state.phase != ConnectionPhase::Connecting
            || !self.transport_connected
            || self.awaiting_answer
        {
            return;
        }
        match &self.channel {
            Some(channel) if channel.is_open() => {}
            _ => return,
        }

        self.timers.cancel(TimerKind::Negotiation);
        self.timers.cancel(TimerKind::Restart);
        self.timers.cancel(TimerKind::DisconnectGrace);
        self.state.negotiation_attempt = 0;
        self.needs_fresh_session = false;
        self.set_phase(ConnectionPhase::Connected);
        self.emit(SessionUpdate::ChannelReady);
        self.status("Connected");
    }

    // ========================================================================
    // Loss, restart, failure
    // ========================================================================

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::DisconnectGrace => {
                if !self.transport_connected {
                    self.on_loss("connection interrupted").await;
                }
            }
            TimerKind::Negotiation => {
                if self.state.phase == ConnectionPhase::Connecting {
                    self.needs_fresh_session = true;
                    self.on_loss("negotiation timed out").await;
                }
            }
            TimerKind::Restart => self.restart().await,
        }
    }

    async fn on_loss(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.is_negotiating() {
            log::debug!("Ignoring loss ({}) while {}", reason, self.state.phase);
            return;
        }
        if self.timers.is_armed(TimerKind::Restart) {
            log::debug!("Loss ({}) while a restart is already scheduled", reason);
            return;
        }

        self.timers.cancel(TimerKind::DisconnectGrace);
        self.timers.cancel(TimerKind::Negotiation);
        self.transport_connected = false;
        self.awaiting_answer = false;

        let attempt = (self.state.negotiation_attempt + 1).min(MAX_RESTARTS);
        self.state.negotiation_attempt = attempt;
        if attempt >= MAX_RESTARTS {
            let advice = self.nat.fallback_advice();
            self.fail(format!(
                "Giving up after {} connection losses (last: {}). {}",
                MAX_RESTARTS, reason, advice
            ))
            .await;
            return;
        }

        let delay = self.nat.restart_delay(attempt);
        self.set_phase(ConnectionPhase::Connecting);
        self.status(format!(
            "Connection lost ({}); retrying in {:.1}s (attempt {}/{})",
            reason,
            delay.as_secs_f64(),
            attempt,
            MAX_RESTARTS
        ));
        self.timers.arm(TimerKind::Restart, delay, &self.queue);
    }

    async fn restart(&mut self) {
        if self.state.phase != ConnectionPhase::Connecting {
            return;
        }
        match self.role {
            Role::Sender => {
                if self.state.target_peer.is_none() {
                    self.status("Waiting for the receiver to join");
                    return;
                }
                let fresh = self.needs_fresh_session || self.session.is_none();
                self.start_offer(fresh).await;
            }
            Role::Receiver => self.request_offer().await,
        }
    }

    /// Permanent failure. The session objects stay so a reconnect can reuse them.
    async fn fail(&mut self, reason: String) {
        self.timers.cancel_all();
        self.abort_transfers(&reason).await;
        self.awaiting_answer = false;
        self.set_phase(ConnectionPhase::Failed);
        log::warn!("Session failed: {}", reason);
        self.emit(SessionUpdate::SessionFailed { reason });
    }

    async fn abort_transfers(&mut self, reason: &str) {
        if self.receiver.is_active() {
            self.receiver.abort().await;
            self.emit(SessionUpdate::TransferFailed {
                reason: format!("Incoming transfer aborted: {}", reason),
                retryable: false,
            });
        }
        if let Some(outbound) = self.outbound.take() {
            outbound.task.abort();
            self.outbound_progress.phase = TransferPhase::Failed;
            self.emit(SessionUpdate::TransferFailed {
                reason: format!("Outgoing transfer aborted: {}", reason),
                retryable: true,
            });
        }
    }

    /// Close the current channel and session; events from them are dropped afterwards
    async fn close_session(&mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                log::debug!("Closing data channel: {:#}", e);
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                log::debug!("Closing transport session: {:#}", e);
            }
        }
        self.generation += 1;
        self.transport_connected = false;
        self.has_remote_description = false;
        self.awaiting_answer = false;
        self.state.pending_remote_candidates.clear();
    }

    async fn replace_session(&mut self) -> Result<()> {
        self.abort_transfers("connection replaced").await;
        self.close_session().await;

        let queue = self.queue.clone();
        let events = TransportEvents::new(self.generation, move |generation, event| {
            let _ = queue.send(Event::Transport { generation, event });
        });
        let session = self
            .transport
            .create_session(events)
            .await
            .context("Failed to create transport session")?;
        self.session = Some(session);
        self.needs_fresh_session = false;
        self.last_applied_offer = None;
        log::debug!("Created transport session generation {}", self.generation);
        Ok(())
    }

    /// Release everything and return to Idle. Safe to call repeatedly.
    async fn teardown(&mut self) {
        self.timers.cancel_all();
        self.abort_transfers("session reset").await;
        self.relay.detach();
        self.close_session().await;

        self.receiver.reset().await;
        self.outbound_progress = TransferProgress::default();
        self.last_offer = None;
        self.last_applied_offer = None;
        self.needs_fresh_session = false;
        self.nat = NatCategory::Unknown;
        self.state.target_peer = None;
        self.state.negotiation_attempt = 0;
        self.set_phase(ConnectionPhase::Idle);
    }
}
