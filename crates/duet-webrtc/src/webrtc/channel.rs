//! `DataChannel` over an `RTCDataChannel`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Notify;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use duet_common::core::transfer::{ChannelMessage, DataChannel};
use duet_common::session::{TransportEvent, TransportEvents};

pub struct RtcChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
    drain: Arc<Notify>,
}

impl RtcChannel {
    /// Wire the channel's callbacks into `events`.
    ///
    /// `ChannelOpen` is emitted once the channel opens (immediately if it
    /// already is), followed by every inbound frame and finally `ChannelClosed`.
    pub async fn attach(inner: Arc<RTCDataChannel>, events: TransportEvents) -> Arc<Self> {
        let channel = Arc::new(Self {
            label: inner.label().to_string(),
            inner: inner.clone(),
            drain: Arc::new(Notify::new()),
        });

        // On open
        let weak = Arc::downgrade(&channel);
        let open_events = events.clone();
        inner.on_open(Box::new(move || {
            if let Some(channel) = weak.upgrade() {
                log::debug!("Data channel '{}' opened", channel.label);
                open_events.emit(TransportEvent::ChannelOpen(channel));
            }
            Box::pin(async {})
        }));

        // On message
        let message_events = events.clone();
        inner.on_message(Box::new(move |msg: DataChannelMessage| {
            let frame = if msg.is_string {
                ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelMessage::Binary(msg.data)
            };
            message_events.emit(TransportEvent::ChannelMessage(frame));
            Box::pin(async {})
        }));

        // On error: wake a sender waiting for drain so it re-checks the state
        let label = channel.label.clone();
        let drain = channel.drain.clone();
        inner.on_error(Box::new(move |err: webrtc::Error| {
            log::error!("Data channel '{}' error: {}", label, err);
            drain.notify_waiters();
            Box::pin(async {})
        }));

        // On close
        let label = channel.label.clone();
        let drain = channel.drain.clone();
        inner.on_close(Box::new(move || {
            log::debug!("Data channel '{}' closed", label);
            drain.notify_waiters();
            events.emit(TransportEvent::ChannelClosed);
            Box::pin(async {})
        }));

        let drain = channel.drain.clone();
        inner
            .on_buffered_amount_low(Box::new(move || {
                drain.notify_waiters();
                Box::pin(async {})
            }))
            .await;

        channel
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        self.inner
            .send_text(text.to_string())
            .await
            .with_context(|| format!("Failed to send text on '{}'", self.label))?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> Result<()> {
        self.inner
            .send(&data)
            .await
            .with_context(|| format!("Failed to send {} bytes on '{}'", data.len(), self.label))?;
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    async fn set_low_water_mark(&self, threshold: usize) {
        self.inner.set_buffered_amount_low_threshold(threshold).await;
    }

    fn drain_signal(&self) -> Arc<Notify> {
        self.drain.clone()
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close()
            .await
            .with_context(|| format!("Failed to close data channel '{}'", self.label))
    }
}
