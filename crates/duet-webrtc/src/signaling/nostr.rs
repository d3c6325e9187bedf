//! Nostr relays as the signaling bus.
//!
//! Event structure (ephemeral kind 24242):
//! - `t` tag: room id (the topic both peers subscribe to)
//! - `type` tag: envelope kind, for readability in relay logs
//! - content: base64 of the envelope JSON
//!
//! Relays fan the same event out over several connections, so deliveries are
//! deduplicated by event id before they reach the coordinator.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use nostr_sdk::prelude::*;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use duet_common::signaling::{RelayConnectionState, SignalEnvelope, SignalRelay, Subscription};

/// Relays used when neither the room code nor the command line names any
pub const DEFAULT_NOSTR_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://nostr.wine",
];

/// Timeout for relay connections
const RELAY_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// How often relay connectivity is sampled
const STATE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// No relay connected for this long counts as a hard failure
const RELAY_FAILED_AFTER: Duration = Duration::from_secs(30);

/// Subscriptions start this far in the past so a join published just before
/// the other side subscribed is not lost
const SUBSCRIPTION_LOOKBACK_SECS: u64 = 60;

/// Event ids remembered for duplicate suppression; the oldest are forgotten first
const SEEN_EVENTS_CAPACITY: usize = 1024;

/// Nostr event kind for signaling (ephemeral range 20000-29999)
pub fn signaling_kind() -> Kind {
    Kind::from_u16(24242)
}

fn room_tag() -> SingleLetterTag {
    SingleLetterTag::lowercase(Alphabet::T)
}

/// Helper to setup client with relays and connect
///
/// Creates a Nostr client, adds the specified relays, connects, and waits
/// for at least one relay to successfully connect.
async fn setup_client_with_relays(keys: &Keys, relay_urls: &[String]) -> Result<Client> {
    let client = Client::new(keys.clone());

    let mut added_relays = 0usize;
    for relay_url in relay_urls {
        match client.add_relay(relay_url).await {
            Ok(_) => added_relays += 1,
            Err(e) => log::error!("Failed to add relay {}: {}", relay_url, e),
        }
    }
    if added_relays == 0 {
        anyhow::bail!("Failed to add any Nostr relays; cannot continue without relays.");
    }

    client.connect().await;
    client.wait_for_connection(RELAY_CONNECTION_TIMEOUT).await;

    let connected = connected_relays(&client).await;
    if connected == 0 {
        anyhow::bail!(
            "Failed to connect to any Nostr relay within timeout. \
             Check network connectivity and relay availability."
        );
    }
    log::debug!("Connected to {}/{} Nostr relays", connected, added_relays);

    Ok(client)
}

async fn connected_relays(client: &Client) -> usize {
    client
        .relays()
        .await
        .values()
        .filter(|r| r.is_connected())
        .count()
}

/// Extract the envelope text from an event, if it belongs to `room`
fn envelope_text(event: &Event, room: &str) -> Option<String> {
    if event.kind != signaling_kind() {
        return None;
    }
    let in_room = event.tags.iter().any(|t| {
        t.kind() == TagKind::SingleLetter(room_tag()) && t.content() == Some(room)
    });
    if !in_room {
        return None;
    }

    let decoded = match STANDARD.decode(&event.content) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::debug!("Dropping event {} with undecodable content: {}", event.id, e);
            return None;
        }
    };
    match String::from_utf8(decoded) {
        Ok(text) => Some(text),
        Err(_) => {
            log::debug!("Dropping event {} with non-UTF-8 content", event.id);
            None
        }
    }
}

/// Signaling relay backed by a pool of Nostr relays, scoped to one room.
pub struct NostrRelay {
    client: Client,
    keys: Keys,
    room: String,
    relay_urls: Vec<String>,
    states: watch::Sender<RelayConnectionState>,
    monitor: JoinHandle<()>,
}

impl NostrRelay {
    /// Connect to `relay_urls` and start watching their connectivity
    pub async fn connect(room: &str, relay_urls: Vec<String>) -> Result<Self> {
        let keys = Keys::generate();
        let client = setup_client_with_relays(&keys, &relay_urls).await?;

        let (states, _) = watch::channel(RelayConnectionState::Connected);
        let monitor = tokio::spawn(monitor_relays(client.clone(), states.clone()));

        Ok(Self {
            client,
            keys,
            room: room.to_string(),
            relay_urls,
            states,
            monitor,
        })
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn relay_urls(&self) -> &[String] {
        &self.relay_urls
    }

    /// Disconnect from relays
    pub async fn disconnect(&self) {
        self.monitor.abort();
        self.client.disconnect().await;
    }

    fn build_event(&self, envelope: &SignalEnvelope) -> Result<Event> {
        let content = STANDARD.encode(envelope.encode()?);
        let tags = vec![
            Tag::custom(TagKind::SingleLetter(room_tag()), vec![self.room.clone()]),
            Tag::custom(
                TagKind::Custom("type".into()),
                vec![envelope.kind.as_str().to_string()],
            ),
        ];

        EventBuilder::new(signaling_kind(), content)
            .tags(tags)
            .sign_with_keys(&self.keys)
            .context("Failed to sign signaling event")
    }
}

impl Drop for NostrRelay {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

#[async_trait]
impl SignalRelay for NostrRelay {
    async fn publish(&self, envelope: &SignalEnvelope) -> Result<()> {
        let event = self.build_event(envelope)?;
        self.client
            .send_event(event.clone())
            .await
            .context("Failed to publish signaling event to Nostr relays")?;
        log::trace!("Published '{}' as event {}", envelope.kind.as_str(), event.id);
        Ok(())
    }

    async fn subscribe(&self, inbox: mpsc::UnboundedSender<String>) -> Result<Subscription> {
        // Listen before subscribing so nothing slips through in between
        let notifications = self.client.notifications();

        let since = Timestamp::from(Timestamp::now().as_u64().saturating_sub(SUBSCRIPTION_LOOKBACK_SECS));
        let filter = Filter::new()
            .kind(signaling_kind())
            .custom_tag(room_tag(), self.room.clone())
            .since(since);
        self.client
            .subscribe(filter, None)
            .await
            .context("Failed to subscribe to signaling events")?;

        let task = tokio::spawn(forward_events(notifications, self.room.clone(), inbox));
        Ok(Subscription::from_task(task))
    }

    fn connection_states(&self) -> watch::Receiver<RelayConnectionState> {
        self.states.subscribe()
    }
}

/// Deliver each room event once, in arrival order, until the inbox closes
async fn forward_events(
    mut notifications: broadcast::Receiver<RelayPoolNotification>,
    room: String,
    inbox: mpsc::UnboundedSender<String>,
) {
    let mut seen: SeenEvents<EventId> = SeenEvents::new(SEEN_EVENTS_CAPACITY);

    loop {
        let event = match notifications.recv().await {
            Ok(RelayPoolNotification::Event { event, .. }) => event,
            Ok(RelayPoolNotification::Message { message, .. }) => match message {
                // Some relays deliver through raw messages only
                nostr_sdk::RelayMessage::Event { event, .. } => event,
                _ => continue,
            },
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                log::warn!("Nostr notification stream lagged, skipped {} messages", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => {
                log::debug!("Nostr notification stream closed");
                break;
            }
        };

        if !seen.insert(event.id) {
            continue;
        }
        if let Some(text) = envelope_text(&event, &room) {
            if inbox.send(text).is_err() {
                log::debug!("Signaling inbox closed, stopping event forwarder");
                break;
            }
        }
    }
}

/// Bounded set of recently delivered ids.
///
/// Relays redeliver an event at most within the subscription window, so
/// forgetting the oldest ids past `capacity` is safe.
struct SeenEvents<T> {
    ids: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
}

impl<T: Hash + Eq + Clone> SeenEvents<T> {
    fn new(capacity: usize) -> Self {
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; false if it is already remembered
    fn insert(&mut self, id: T) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

/// Sample relay connectivity and publish state transitions
async fn monitor_relays(client: Client, states: watch::Sender<RelayConnectionState>) {
    let mut interval = tokio::time::interval(STATE_POLL_INTERVAL);
    let mut offline_since: Option<tokio::time::Instant> = None;

    loop {
        interval.tick().await;
        let connected = connected_relays(&client).await;

        let state = if connected > 0 {
            offline_since = None;
            RelayConnectionState::Connected
        } else {
            let since = *offline_since.get_or_insert_with(tokio::time::Instant::now);
            if since.elapsed() >= RELAY_FAILED_AFTER {
                RelayConnectionState::Failed
            } else {
                RelayConnectionState::Disconnected
            }
        };

        states.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            log::debug!("Nostr relays {} -> {} ({} connected)", current, state, connected);
            *current = state;
            true
        });
    }
}
