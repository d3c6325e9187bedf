//! Relay capability and the adapter that routes envelopes to the coordinator.
//!
//! The relay is a pub/sub channel scoped to one room. Delivery is
//! at-least-once and includes our own publications, so the coordinator
//! filters by addressing (see [`SignalEnvelope::is_for`]).

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::envelope::SignalEnvelope;

/// Connectivity of the relay client itself (not of the peer session)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayConnectionState {
    #[default]
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Failed,
}

impl fmt::Display for RelayConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelayConnectionState::Connecting => "connecting",
            RelayConnectionState::Connected => "connected",
            RelayConnectionState::Disconnected => "disconnected",
            RelayConnectionState::Suspended => "suspended",
            RelayConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Unsubscribe token. Dropping it cancels the subscription.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription backed by a background delivery task
    pub fn from_task(handle: JoinHandle<()>) -> Self {
        Self::new(move || handle.abort())
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

/// Pub/sub relay scoped to one room topic.
#[async_trait]
pub trait SignalRelay: Send + Sync {
    /// Publish an envelope to the room
    async fn publish(&self, envelope: &SignalEnvelope) -> Result<()>;

    /// Deliver raw envelope JSON for the room to `inbox` until unsubscribed
    async fn subscribe(&self, inbox: mpsc::UnboundedSender<String>) -> Result<Subscription>;

    /// Relay client connectivity
    fn connection_states(&self) -> watch::Receiver<RelayConnectionState>;
}

/// Something arriving from the relay side
#[derive(Debug, Clone)]
pub enum InboundSignal {
    /// Raw envelope JSON, not yet validated
    Envelope(String),
    State(RelayConnectionState),
}

/// Thin pass-through between a [`SignalRelay`] and the coordinator queue.
pub struct RelayAdapter {
    relay: Arc<dyn SignalRelay>,
    subscription: Option<Subscription>,
    forwarder: Option<JoinHandle<()>>,
}

impl RelayAdapter {
    pub fn new(relay: Arc<dyn SignalRelay>) -> Self {
        Self {
            relay,
            subscription: None,
            forwarder: None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.subscription.is_some()
    }

    /// Subscribe to the room and forward envelopes and relay state changes
    /// into `queue`. Attaching twice is a no-op.
    pub async fn attach<T>(&mut self, queue: mpsc::UnboundedSender<T>) -> Result<()>
    where
        T: From<InboundSignal> + Send + 'static,
    {
        if self.is_attached() {
            return Ok(());
        }

        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel::<String>();
        let subscription = self
            .relay
            .subscribe(inbox_tx)
            .await
            .context("Failed to subscribe to signaling relay")?;

        let mut states = self.relay.connection_states();
        let initial = *states.borrow_and_update();

        let forwarder = tokio::spawn(async move {
            if queue.send(T::from(InboundSignal::State(initial))).is_err() {
                return;
            }
            let mut states_open = true;
            loop {
                tokio::select! {
                    raw = inbox_rx.recv() => {
                        let Some(raw) = raw else { break };
                        if queue.send(T::from(InboundSignal::Envelope(raw))).is_err() {
                            break;
                        }
                    }
                    changed = states.changed(), if states_open => {
                        if changed.is_err() {
                            states_open = false;
                            continue;
                        }
                        let state = *states.borrow_and_update();
                        if queue.send(T::from(InboundSignal::State(state))).is_err() {
                            break;
                        }
                    }
                }
            }
            log::debug!("Relay forwarder stopped");
        });

        self.subscription = Some(subscription);
        self.forwarder = Some(forwarder);
        Ok(())
    }

    pub async fn publish(&self, envelope: &SignalEnvelope) -> Result<()> {
        self.relay
            .publish(envelope)
            .await
            .with_context(|| format!("Failed to publish '{}' envelope", envelope.kind.as_str()))
    }

    /// Stop delivery. Safe to call when not attached.
    pub fn detach(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

impl Drop for RelayAdapter {
    fn drop(&mut self) {
        self.detach();
    }
}
