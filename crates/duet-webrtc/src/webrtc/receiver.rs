//! Receive side: join a sender's room and save the file it pushes.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

use duet_common::core::room::parse_room_code;
use duet_common::core::sink::{DirectoryTarget, ReceivedFile, SinkKind};
use duet_common::core::transfer::{format_bytes, Interrupted};
use duet_common::session::{spawn_session, Role, SessionConfig, SessionHandle, SessionUpdate};
use duet_common::signaling::PeerIdentity;

use crate::signaling::nostr::{NostrRelay, DEFAULT_NOSTR_RELAYS};
use crate::webrtc::common::{IceConfig, WebRtcTransport};
use crate::webrtc::console::{prompt_reconnect, report, ProgressLine};

/// Options for the receive command
#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    /// Output directory (defaults to current directory)
    pub output_dir: Option<PathBuf>,
    /// Keep the file in memory until it is complete
    pub in_memory: bool,
    pub ice: IceConfig,
}

/// Receive a file via WebRTC with Nostr signaling
pub async fn receive_webrtc(code: &str, options: ReceiveOptions) -> Result<()> {
    eprintln!("Parsing room code...");
    let room_code = parse_room_code(code).context("Failed to parse room code")?;

    let output_dir = match &options.output_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };

    let relay_urls = room_code
        .relays
        .clone()
        .unwrap_or_else(|| DEFAULT_NOSTR_RELAYS.iter().map(|s| s.to_string()).collect());

    eprintln!("Connecting to Nostr relays for signaling...");
    let relay = Arc::new(NostrRelay::connect(&room_code.room, relay_urls).await?);
    log::debug!("Signaling in room {} via {:?}", relay.room(), relay.relay_urls());
    let transport = Arc::new(WebRtcTransport::new(options.ice.clone())?);

    let identity = PeerIdentity::generate();
    log::debug!("Local identity: {}", identity);
    let mut config = SessionConfig::new(Role::Receiver, identity);
    if !options.in_memory {
        match DirectoryTarget::acquire(&output_dir).await {
            Ok(target) => config = config.with_disk_target(Arc::new(target)),
            Err(e) => {
                log::warn!("Streaming to disk unavailable, buffering in memory: {:#}", e);
            }
        }
    }

    let (handle, updates, task) = spawn_session(config, transport, relay.clone());
    handle.start()?;
    eprintln!("Joining room {}...", room_code.room);

    let result = tokio::select! {
        result = drive_receiver(&handle, updates, &output_dir) => result,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nInterrupted, closing connection...");
            Err(Interrupted.into())
        }
    };

    let _ = handle.shutdown().await;
    drop(handle);
    let _ = task.await;
    relay.disconnect().await;

    result
}

async fn drive_receiver(
    handle: &SessionHandle,
    mut updates: mpsc::UnboundedReceiver<SessionUpdate>,
    output_dir: &Path,
) -> Result<()> {
    let mut progress = ProgressLine::default();

    while let Some(update) = updates.recv().await {
        if report(&update, &mut progress) {
            continue;
        }

        match update {
            SessionUpdate::ChannelReady => {
                eprintln!("Data channel open, waiting for file...");
            }
            SessionUpdate::ReceiveStarted { meta, sink } => {
                let target = match sink {
                    SinkKind::Disk => "disk",
                    SinkKind::Memory => "memory",
                };
                eprintln!(
                    "Receiving: {} ({}, {}) to {}",
                    meta.name,
                    format_bytes(meta.total_size),
                    meta.mime_type,
                    target
                );
            }
            SessionUpdate::ReceiveProgress(p) => progress.update("Receiving", &p),
            SessionUpdate::FileReceived(file) => {
                progress.finish();
                let path = save(file, output_dir).await?;
                eprintln!("File saved to: {}", path.display());
                return Ok(());
            }
            SessionUpdate::SessionFailed { reason } => {
                progress.finish();
                if !prompt_reconnect(&reason).await? {
                    anyhow::bail!(
                        "WebRTC connection failed: {}\n\n\
                         If a direct connection is not possible, ask the sender to retry with a TURN relay (--turn-url).",
                        reason
                    );
                }
                handle.reconnect()?;
            }
            _ => {}
        }
    }

    anyhow::bail!("Session ended before a file was received")
}

async fn save(file: ReceivedFile, output_dir: &Path) -> Result<PathBuf> {
    if let ReceivedFile::InMemory { data, .. } = &file {
        log::debug!("Writing {} buffered bytes", data.len());
    }
    file.persist(output_dir).await
}
