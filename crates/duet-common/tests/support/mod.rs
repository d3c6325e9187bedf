//! In-memory fakes for the relay, transport and data channel.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use duet_common::core::sink::{DiskTarget, ProgressiveWriter};
use duet_common::core::transfer::{ChannelMessage, DataChannel, FileMeta};
use duet_common::session::{
    ConnectionPhase, NegotiationSession, SessionHandle, SessionUpdate, Transport, TransportEvent,
    TransportEvents, TransportState, CHANNEL_LABEL,
};
use duet_common::signaling::{
    CandidateInfo, CandidatePayload, DescriptionPayload, PeerIdentity, RelayConnectionState,
    SignalEnvelope, SignalKind, SignalRelay, Subscription,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

// ============================================================================
// Data channel
// ============================================================================

/// Data channel with a simulated send buffer.
///
/// With `auto_drain` the buffer empties instantly; otherwise bytes stay
/// buffered until [`FakeChannel::drain`] (or a drainer task) removes them.
pub struct FakeChannel {
    open: AtomicBool,
    auto_drain: bool,
    buffered: AtomicUsize,
    low_water: AtomicUsize,
    peak_buffered: AtomicUsize,
    signal: Arc<Notify>,
    sent: Mutex<Vec<ChannelMessage>>,
    peer: Mutex<Option<TransportEvents>>,
}

impl FakeChannel {
    pub fn new(auto_drain: bool) -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            auto_drain,
            buffered: AtomicUsize::new(0),
            low_water: AtomicUsize::new(0),
            peak_buffered: AtomicUsize::new(0),
            signal: Arc::new(Notify::new()),
            sent: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
        })
    }

    /// Deliver every frame sent on this channel to `peer` as channel messages
    pub fn connect_to(&self, peer: TransportEvents) {
        *self.peer.lock().unwrap() = Some(peer);
    }

    pub fn sent(&self) -> Vec<ChannelMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_binary_lengths(&self) -> Vec<usize> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                ChannelMessage::Binary(b) => Some(b.len()),
                ChannelMessage::Text(_) => None,
            })
            .collect()
    }

    pub fn low_water(&self) -> usize {
        self.low_water.load(Ordering::SeqCst)
    }

    pub fn peak_buffered(&self) -> usize {
        self.peak_buffered.load(Ordering::SeqCst)
    }

    /// Remove up to `bytes` from the buffer, firing the drain signal when it
    /// drops to the low-water mark
    pub fn drain(&self, bytes: usize) {
        let before = self.buffered.load(Ordering::SeqCst);
        let after = before.saturating_sub(bytes);
        self.buffered.store(after, Ordering::SeqCst);
        if before > self.low_water() && after <= self.low_water() {
            self.signal.notify_waiters();
        }
    }

    /// Drain `bytes_per_tick` every `tick` until the channel closes
    pub fn spawn_drainer(self: &Arc<Self>, bytes_per_tick: usize, tick: Duration) -> JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            while channel.is_open() {
                interval.tick().await;
                channel.drain(bytes_per_tick);
            }
        })
    }

    /// Close from the remote side
    pub fn close_now(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.signal.notify_waiters();
    }

    fn record(&self, message: ChannelMessage, len: usize) -> Result<()> {
        if !self.is_open() {
            anyhow::bail!("channel closed");
        }
        if !self.auto_drain {
            let now = self.buffered.fetch_add(len, Ordering::SeqCst) + len;
            self.peak_buffered.fetch_max(now, Ordering::SeqCst);
        }
        self.sent.lock().unwrap().push(message.clone());
        if let Some(peer) = self.peer.lock().unwrap().as_ref() {
            peer.emit(TransportEvent::ChannelMessage(message));
        }
        Ok(())
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> &str {
        CHANNEL_LABEL
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.record(ChannelMessage::Text(text.to_string()), text.len())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        let len = data.len();
        self.record(ChannelMessage::Binary(data), len)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn set_low_water_mark(&self, threshold: usize) {
        self.low_water.store(threshold, Ordering::SeqCst);
    }

    fn drain_signal(&self) -> Arc<Notify> {
        self.signal.clone()
    }

    async fn close(&self) -> Result<()> {
        self.close_now();
        Ok(())
    }
}

// ============================================================================
// Relay
// ============================================================================

/// Shared pub/sub topic. Publications reach every subscriber, including the
/// publisher itself.
#[derive(Default)]
pub struct RelayBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, mpsc::UnboundedSender<String>)>>,
    published: Mutex<Vec<SignalEnvelope>>,
}

impl RelayBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<SignalEnvelope> {
        self.published.lock().unwrap().clone()
    }

    pub fn published_by(&self, from: &PeerIdentity, kind: SignalKind) -> Vec<SignalEnvelope> {
        self.published()
            .into_iter()
            .filter(|e| &e.from == from && e.kind == kind)
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Deliver raw text without recording it as a publication
    pub fn inject_raw(&self, raw: &str) {
        for (_, tx) in self.subscribers.lock().unwrap().iter() {
            let _ = tx.send(raw.to_string());
        }
    }

    pub fn inject(&self, envelope: &SignalEnvelope) {
        self.inject_raw(&envelope.encode().unwrap());
    }

    fn deliver(&self, envelope: &SignalEnvelope) -> Result<()> {
        self.published.lock().unwrap().push(envelope.clone());
        self.inject_raw(&envelope.encode()?);
        Ok(())
    }

    fn add(self: &Arc<Self>, tx: mpsc::UnboundedSender<String>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().push((id, tx));
        let bus = self.clone();
        Subscription::new(move || {
            bus.subscribers.lock().unwrap().retain(|(sid, _)| *sid != id);
        })
    }
}

pub struct FakeRelay {
    bus: Arc<RelayBus>,
    states: watch::Sender<RelayConnectionState>,
}

impl FakeRelay {
    pub fn new(bus: Arc<RelayBus>) -> Arc<Self> {
        let (states, _) = watch::channel(RelayConnectionState::Connected);
        Arc::new(Self { bus, states })
    }

    pub fn set_state(&self, state: RelayConnectionState) {
        self.states.send_replace(state);
    }
}

#[async_trait]
impl SignalRelay for FakeRelay {
    async fn publish(&self, envelope: &SignalEnvelope) -> Result<()> {
        self.bus.deliver(envelope)
    }

    async fn subscribe(&self, inbox: mpsc::UnboundedSender<String>) -> Result<Subscription> {
        Ok(self.bus.add(inbox))
    }

    fn connection_states(&self) -> watch::Receiver<RelayConnectionState> {
        self.states.subscribe()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// What one fake negotiation session saw
pub struct SessionRecord {
    pub id: u64,
    pub events: TransportEvents,
    calls: Mutex<Vec<String>>,
    remote_candidates: Mutex<Vec<CandidatePayload>>,
    closed: AtomicBool,
    channel: Mutex<Option<Arc<FakeChannel>>>,
}

impl SessionRecord {
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn remote_candidates(&self) -> Vec<CandidatePayload> {
        self.remote_candidates.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> Option<Arc<FakeChannel>> {
        self.channel.lock().unwrap().clone()
    }

    pub fn emit_state(&self, state: TransportState) {
        self.events.emit(TransportEvent::ConnectionState(state));
    }

    /// Open an instantly-draining channel and report the transport connected
    pub fn connect(&self) -> Arc<FakeChannel> {
        let channel = FakeChannel::new(true);
        *self.channel.lock().unwrap() = Some(channel.clone());
        self.emit_state(TransportState::Connected);
        self.events.emit(TransportEvent::ChannelOpen(channel.clone()));
        channel
    }

    fn call(&self, name: String) {
        self.calls.lock().unwrap().push(name);
    }
}

/// Records every session and optionally links offerer and answerer
/// automatically once the answer is applied.
pub struct FakeNetwork {
    link: bool,
    candidates: Vec<String>,
    next_id: AtomicU64,
    sessions: Mutex<Vec<Arc<SessionRecord>>>,
    offers: Mutex<HashMap<String, Arc<SessionRecord>>>,
}

impl FakeNetwork {
    /// Sessions connect only when a test drives them
    pub fn manual() -> Arc<Self> {
        Self::build(false)
    }

    /// Sessions connect as soon as the offerer applies the answer
    pub fn linked() -> Arc<Self> {
        Self::build(true)
    }

    fn build(link: bool) -> Arc<Self> {
        Arc::new(Self {
            link,
            candidates: vec![
                "candidate:1 1 udp 2122260223 192.168.1.20 50000 typ host".to_string(),
                "candidate:2 1 udp 2122260222 10.0.0.20 50001 typ host".to_string(),
            ],
            next_id: AtomicU64::new(1),
            sessions: Mutex::new(Vec::new()),
            offers: Mutex::new(HashMap::new()),
        })
    }

    pub fn sessions(&self) -> Vec<Arc<SessionRecord>> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn latest(&self) -> Arc<SessionRecord> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session created")
    }

    fn link(&self, offerer: &SessionRecord, answerer: &SessionRecord) {
        let a = FakeChannel::new(true);
        let b = FakeChannel::new(true);
        a.connect_to(answerer.events.clone());
        b.connect_to(offerer.events.clone());
        *offerer.channel.lock().unwrap() = Some(a.clone());
        *answerer.channel.lock().unwrap() = Some(b.clone());

        for (record, channel) in [(offerer, a), (answerer, b)] {
            record.emit_state(TransportState::Connected);
            record.events.emit(TransportEvent::ChannelOpen(channel));
        }
    }
}

pub struct FakeTransport {
    network: Arc<FakeNetwork>,
}

impl FakeTransport {
    pub fn new(network: Arc<FakeNetwork>) -> Arc<Self> {
        Arc::new(Self { network })
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn create_session(&self, events: TransportEvents) -> Result<Box<dyn NegotiationSession>> {
        let record = Arc::new(SessionRecord {
            id: self.network.next_id.fetch_add(1, Ordering::SeqCst),
            events,
            calls: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            channel: Mutex::new(None),
        });
        self.network.sessions.lock().unwrap().push(record.clone());
        Ok(Box::new(FakeSession {
            record,
            network: self.network.clone(),
            offers_made: AtomicU64::new(0),
            remote_offer: Mutex::new(None),
        }))
    }
}

struct FakeSession {
    record: Arc<SessionRecord>,
    network: Arc<FakeNetwork>,
    offers_made: AtomicU64,
    remote_offer: Mutex<Option<String>>,
}

#[async_trait]
impl NegotiationSession for FakeSession {
    async fn create_channel(&self, label: &str) -> Result<()> {
        self.record.call(format!("create_channel({})", label));
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String> {
        self.record.call(format!("create_offer(restart={})", ice_restart));
        let n = self.offers_made.fetch_add(1, Ordering::SeqCst);
        Ok(format!("offer-{}-{}", self.record.id, n))
    }

    async fn create_answer(&self) -> Result<String> {
        self.record.call("create_answer".to_string());
        let offer = self.remote_offer.lock().unwrap().clone();
        match offer {
            Some(offer) => Ok(format!("answer:{}", offer)),
            None => anyhow::bail!("no remote offer"),
        }
    }

    async fn apply_remote_offer(&self, sdp: &str) -> Result<()> {
        self.record.call(format!("apply_remote_offer({})", sdp));
        *self.remote_offer.lock().unwrap() = Some(sdp.to_string());
        self.network
            .offers
            .lock()
            .unwrap()
            .insert(sdp.to_string(), self.record.clone());
        Ok(())
    }

    async fn apply_remote_answer(&self, sdp: &str) -> Result<()> {
        self.record.call(format!("apply_remote_answer({})", sdp));
        if !self.network.link {
            return Ok(());
        }
        let offer = sdp.strip_prefix("answer:").unwrap_or(sdp);
        let answerer = self.network.offers.lock().unwrap().get(offer).cloned();
        if let Some(answerer) = answerer {
            self.network.link(&self.record, &answerer);
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &CandidatePayload) -> Result<()> {
        CandidateInfo::from_payload(candidate)?;
        self.record
            .remote_candidates
            .lock()
            .unwrap()
            .push(candidate.clone());
        Ok(())
    }

    async fn gather_candidates(&self, _timeout: Duration) -> Vec<CandidateInfo> {
        self.network
            .candidates
            .iter()
            .filter_map(|raw| CandidateInfo::parse(raw, Some("0".to_string()), Some(0)).ok())
            .collect()
    }

    async fn close(&self) -> Result<()> {
        self.record.call("close".to_string());
        self.record.closed.store(true, Ordering::SeqCst);
        if let Some(channel) = self.record.channel() {
            channel.close_now();
        }
        Ok(())
    }
}

// ============================================================================
// Disk
// ============================================================================

/// Disk target whose writers fail once more than `limit` bytes are written
pub struct FailingDisk {
    pub limit: usize,
    pub aborted: Arc<AtomicUsize>,
}

struct FailingWriter {
    limit: usize,
    written: usize,
    aborted: Arc<AtomicUsize>,
}

#[async_trait]
impl DiskTarget for FailingDisk {
    async fn open_writer(&self, _meta: &FileMeta) -> Result<Box<dyn ProgressiveWriter>> {
        Ok(Box::new(FailingWriter {
            limit: self.limit,
            written: 0,
            aborted: self.aborted.clone(),
        }))
    }
}

#[async_trait]
impl ProgressiveWriter for FailingWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.written + data.len() > self.limit {
            anyhow::bail!("no space left on device");
        }
        self.written += data.len();
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<PathBuf> {
        Ok(PathBuf::from("unused"))
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Let every ready task run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn wait_for_phase(handle: &SessionHandle, phase: ConnectionPhase) {
    let mut snapshots = handle.watch();
    tokio::time::timeout(Duration::from_secs(20), snapshots.wait_for(|s| s.phase == phase))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", phase))
        .expect("coordinator stopped");
}

/// Next update matching `pred`, skipping others
pub async fn next_update<F>(updates: &mut mpsc::UnboundedReceiver<SessionUpdate>, pred: F) -> SessionUpdate
where
    F: Fn(&SessionUpdate) -> bool,
{
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let update = updates.recv().await.expect("update stream closed");
            if pred(&update) {
                return update;
            }
        }
    })
    .await
    .expect("timed out waiting for update")
}

/// Everything queued so far
pub fn drain_updates(updates: &mut mpsc::UnboundedReceiver<SessionUpdate>) -> Vec<SessionUpdate> {
    let mut out = Vec::new();
    while let Ok(update) = updates.try_recv() {
        out.push(update);
    }
    out
}

pub fn description(envelope: &SignalEnvelope) -> DescriptionPayload {
    envelope.description().expect("envelope has no description")
}

pub fn offer_from(from: &PeerIdentity, to: &PeerIdentity, sdp: &str, ice_restart: bool) -> SignalEnvelope {
    let payload = DescriptionPayload {
        sdp: sdp.to_string(),
        sdp_type: "offer".to_string(),
        candidates: vec![candidate("203.0.113.9", 40000)],
        ice_restart,
    };
    SignalEnvelope::offer(from, to, &payload).unwrap()
}

pub fn answer_from(from: &PeerIdentity, to: &PeerIdentity, sdp: &str) -> SignalEnvelope {
    let payload = DescriptionPayload {
        sdp: sdp.to_string(),
        sdp_type: "answer".to_string(),
        candidates: vec![],
        ice_restart: false,
    };
    SignalEnvelope::answer(from, to, &payload).unwrap()
}

pub fn candidate(address: &str, port: u16) -> CandidatePayload {
    CandidatePayload {
        candidate: format!("candidate:9 1 udp 1686052607 {} {} typ srflx", address, port),
        sdp_mid: Some("0".to_string()),
        sdp_m_line_index: Some(0),
    }
}
