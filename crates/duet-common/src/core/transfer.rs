//! Chunked file transfer over an ordered, reliable data channel.
//!
//! Wire protocol inside the channel:
//! - text frame `{"kind":"meta","payload":FileMeta}` opens a transfer
//! - binary frames carry file data in order, `chunkSize` bytes each except the last
//! - text frame `{"kind":"done"}` closes it
//!
//! The sender throttles on the channel's buffered amount so a fast disk can't
//! queue the whole file inside the SCTP stack.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Error returned when a transfer is interrupted by Ctrl+C.
///
/// This error should be handled at the CLI level by exiting with code 130
/// (standard Unix convention for SIGINT).
#[derive(Debug, Clone, Copy)]
pub struct Interrupted;

impl std::fmt::Display for Interrupted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transfer interrupted")
    }
}

impl std::error::Error for Interrupted {}

/// Check if an error is an Interrupted error.
pub fn is_interrupted(err: &anyhow::Error) -> bool {
    err.downcast_ref::<Interrupted>().is_some()
}

/// Default chunk size (48 KiB).
/// webrtc-rs receives into a 64 KiB buffer; staying below it avoids
/// "buffer too short" errors on the remote side.
pub const DEFAULT_CHUNK_SIZE: usize = 48 * 1024;

/// Largest chunk the sender will emit
pub const MAX_CHUNK_SIZE: usize = 256 * 1024;

/// Sender pauses while more than `chunk_size * LOW_WATER_FACTOR` bytes are buffered
pub const LOW_WATER_FACTOR: usize = 8;

/// How long the buffer may sit without shrinking before the sender gives up
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(6);

/// Re-check interval while waiting for a drain notification
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// File description sent once as the first control message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub mime_type: String,
    pub total_size: u64,
    pub chunk_size: usize,
    pub total_chunks: u64,
}

impl FileMeta {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        total_size: u64,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        if total_size == 0 {
            return Err(TransferError::EmptyFile);
        }
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::InvalidChunkSize(chunk_size));
        }
        Ok(Self {
            name: name.into(),
            mime_type: mime_type.into(),
            total_size,
            chunk_size,
            total_chunks: total_size.div_ceil(chunk_size as u64),
        })
    }

    /// Reject metadata whose fields disagree with each other
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.total_size == 0 {
            return Err(TransferError::Protocol("meta announces an empty file".into()));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::Protocol("meta announces a zero chunk size".into()));
        }
        let expected = self.total_size.div_ceil(self.chunk_size as u64);
        if self.total_chunks != expected {
            return Err(TransferError::Protocol(format!(
                "meta announces {} chunks, expected {}",
                self.total_chunks, expected
            )));
        }
        Ok(())
    }

    /// Length of chunk `index` (0-based)
    pub fn chunk_len(&self, index: u64) -> usize {
        let start = index * self.chunk_size as u64;
        (self.total_size.saturating_sub(start)).min(self.chunk_size as u64) as usize
    }
}

/// Control frames (sent as text)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum ControlMessage {
    Meta(FileMeta),
    Done,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<String, TransferError> {
        serde_json::to_string(self).map_err(|e| TransferError::Protocol(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, TransferError> {
        serde_json::from_str(text)
            .map_err(|e| TransferError::Protocol(format!("malformed control frame: {}", e)))
    }
}

/// A frame received on the data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// Ordered, reliable message channel between the two peers.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn send_binary(&self, data: Bytes) -> Result<()>;

    /// Bytes queued locally but not yet acknowledged by the transport
    async fn buffered_amount(&self) -> usize;

    /// Fire [`DataChannel::drain_signal`] once the buffered amount drops below `threshold`
    async fn set_low_water_mark(&self, threshold: usize);

    /// Notified on buffered-amount-low, close and error
    fn drain_signal(&self) -> Arc<Notify>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferPhase {
    #[default]
    Idle,
    InProgress,
    Complete,
    Failed,
}

/// Progress of one direction of transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferProgress {
    pub bytes_moved: u64,
    pub total: u64,
    pub phase: TransferPhase,
}

impl TransferProgress {
    pub fn started(total: u64) -> Self {
        Self {
            bytes_moved: 0,
            total,
            phase: TransferPhase::InProgress,
        }
    }

    /// Percentage, capped at 100
    pub fn percent(&self) -> f64 {
        calc_percent(self.bytes_moved, self.total).min(100.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("refusing to send an empty file")]
    EmptyFile,
    #[error("chunk size {0} is outside 1..={max}", max = MAX_CHUNK_SIZE)]
    InvalidChunkSize(usize),
    #[error("timed out waiting for the data channel to drain")]
    DrainTimeout,
    #[error("data channel closed mid-transfer")]
    ChannelClosed,
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("failed to read source file: {0}")]
    Source(#[from] std::io::Error),
    #[error("disk I/O error: {0}")]
    Disk(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransferError {
    /// Whether the user may reasonably retry once the session is back
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::DrainTimeout | TransferError::ChannelClosed | TransferError::Channel(_)
        )
    }
}

/// A readable file plus the metadata announced for it
pub struct FileSource {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl FileSource {
    /// Open a file on disk for sending
    pub async fn open(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to read metadata for {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Invalid filename")?
            .to_string();
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        Ok(Self::from_reader(name, metadata.len(), file))
    }

    pub fn from_reader(
        name: impl Into<String>,
        size: u64,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        let name = name.into();
        Self {
            mime_type: mime_type_for(&name).to_string(),
            name,
            size,
            reader: Box::new(reader),
        }
    }

    /// In-memory source
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::from_reader(name, size, std::io::Cursor::new(data))
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Stream `source` over `channel`: `meta`, the chunks, then `done`.
///
/// `on_progress` is called after every chunk with a monotonically
/// non-decreasing byte count. Returns the announced metadata once the
/// channel buffer has fully drained.
pub async fn send_file<F>(
    channel: &dyn DataChannel,
    mut source: FileSource,
    chunk_size: usize,
    mut on_progress: F,
) -> Result<FileMeta, TransferError>
where
    F: FnMut(TransferProgress) + Send,
{
    let meta = FileMeta::new(
        source.name.clone(),
        source.mime_type.clone(),
        source.size,
        chunk_size,
    )?;
    if !channel.is_open() {
        return Err(TransferError::ChannelClosed);
    }

    let low_water = chunk_size * LOW_WATER_FACTOR;
    channel.set_low_water_mark(low_water).await;

    let meta_frame = ControlMessage::Meta(meta.clone()).encode()?;
    channel
        .send_text(&meta_frame)
        .await
        .map_err(|e| TransferError::Channel(format!("{:#}", e)))?;

    log::debug!(
        "Sending {} ({} bytes) in {} chunks of {}",
        meta.name,
        meta.total_size,
        meta.total_chunks,
        chunk_size
    );

    let mut progress = TransferProgress::started(meta.total_size);
    on_progress(progress);

    for index in 0..meta.total_chunks {
        let len = meta.chunk_len(index);
        let mut buf = vec![0u8; len];
        source.reader.read_exact(&mut buf).await?;

        wait_for_drain(channel, low_water).await?;
        channel
            .send_binary(Bytes::from(buf))
            .await
            .map_err(|e| TransferError::Channel(format!("{:#}", e)))?;

        progress.bytes_moved += len as u64;
        on_progress(progress);
    }

    let done_frame = ControlMessage::Done.encode()?;
    channel
        .send_text(&done_frame)
        .await
        .map_err(|e| TransferError::Channel(format!("{:#}", e)))?;

    // Everything is queued; completion means it actually left the buffer
    wait_for_drain(channel, 0).await?;

    progress.phase = TransferPhase::Complete;
    on_progress(progress);
    Ok(meta)
}

/// Suspend until the buffered amount is at most `threshold`.
///
/// The deadline restarts whenever the buffer shrinks, so only a channel that
/// stops draining for [`DRAIN_TIMEOUT`] fails. A slow link that keeps moving
/// bytes is never cut off.
async fn wait_for_drain(channel: &dyn DataChannel, threshold: usize) -> Result<(), TransferError> {
    let signal = channel.drain_signal();
    let mut deadline = Instant::now() + DRAIN_TIMEOUT;
    let mut last_buffered = usize::MAX;

    loop {
        let notified = signal.notified();
        tokio::pin!(notified);
        // Register before checking so a notification between the check and the await isn't lost
        notified.as_mut().enable();

        if !channel.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        let buffered = channel.buffered_amount().await;
        if buffered <= threshold {
            return Ok(());
        }

        let now = Instant::now();
        if buffered < last_buffered {
            deadline = now + DRAIN_TIMEOUT;
        }
        last_buffered = buffered;

        if now >= deadline {
            log::debug!("Data channel stuck at {} buffered bytes", buffered);
            return Err(TransferError::DrainTimeout);
        }
        let wait = (deadline - now).min(DRAIN_POLL_INTERVAL);
        let _ = tokio::time::timeout(wait, notified).await;
    }
}

/// Guess a mime type from the file extension
pub fn mime_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

/// Format bytes for human-readable display
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Calculate percentage safely, avoiding division by zero
pub fn calc_percent(current: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        current as f64 / total as f64 * 100.0
    }
}
