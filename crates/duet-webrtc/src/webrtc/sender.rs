//! Send side: open a room on the Nostr relays and push one file to whoever joins.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use duet_common::core::room::{generate_room_code, generate_room_id};
use duet_common::core::transfer::{format_bytes, FileSource, Interrupted, MAX_CHUNK_SIZE};
use duet_common::session::{spawn_session, ConnectionPhase, Role, SessionConfig, SessionHandle, SessionUpdate};
use duet_common::signaling::PeerIdentity;

use crate::signaling::nostr::{NostrRelay, DEFAULT_NOSTR_RELAYS};
use crate::webrtc::common::{IceConfig, WebRtcTransport};
use crate::webrtc::console::{prompt_reconnect, report, ProgressLine};

/// How long to wait for the receiver to hang up after the last chunk
const PEER_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for the send command
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub relays: Vec<String>,
    pub chunk_size: usize,
    pub ice_batch: bool,
    pub ice: IceConfig,
}

/// Display the room code to the user with instructions
fn display_room_code(code: &str) {
    eprintln!("\n--- Receiver Instructions ---");
    eprintln!("Run: duet-webrtc receive");
    eprintln!("Room code:\n{}\n", code);
}

/// Send a file via WebRTC with Nostr signaling
pub async fn send_file_webrtc(file_path: &Path, options: SendOptions) -> Result<()> {
    if options.chunk_size == 0 || options.chunk_size > MAX_CHUNK_SIZE {
        anyhow::bail!(
            "Chunk size must be between 1 and {} bytes",
            MAX_CHUNK_SIZE
        );
    }

    // Fail early on unreadable or empty files, before anyone joins
    let probe = FileSource::open(file_path).await?;
    if probe.size == 0 {
        anyhow::bail!("Cannot send empty file: {}", file_path.display());
    }
    let (filename, file_size) = (probe.name.clone(), probe.size);
    drop(probe);

    let relay_urls: Vec<String> = if options.relays.is_empty() {
        DEFAULT_NOSTR_RELAYS.iter().map(|s| s.to_string()).collect()
    } else {
        options.relays.clone()
    };
    let custom_relays = (!options.relays.is_empty()).then(|| relay_urls.clone());

    let room = generate_room_id();
    eprintln!("Connecting to Nostr relays for signaling...");
    let relay = Arc::new(NostrRelay::connect(&room, relay_urls).await?);
    log::debug!("Signaling in room {} via {:?}", relay.room(), relay.relay_urls());
    let transport = Arc::new(WebRtcTransport::new(options.ice.clone())?);

    let code = generate_room_code(&room, custom_relays)?;
    display_room_code(&code);
    eprintln!("Filename: {}", filename);
    eprintln!("Size: {}", format_bytes(file_size));
    eprintln!("\nWaiting for receiver to connect...");

    let identity = PeerIdentity::generate();
    log::debug!("Local identity: {}", identity);
    let mut config = SessionConfig::new(Role::Sender, identity);
    config.chunk_size = options.chunk_size;
    config.redundant_candidate_batch = options.ice_batch;

    let (handle, updates, task) = spawn_session(config, transport, relay.clone());
    handle.start()?;

    let result = tokio::select! {
        result = drive_sender(&handle, updates, file_path) => result,
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

async fn drive_sender(
    handle: &SessionHandle,
    mut updates: mpsc::UnboundedReceiver<SessionUpdate>,
    file_path: &Path,
) -> Result<()> {
    let mut progress = ProgressLine::default();
    let mut sending = false;

    while let Some(update) = updates.recv().await {
        if report(&update, &mut progress) {
            if let SessionUpdate::TransferFailed { .. } = update {
                sending = false;
            }
            continue;
        }

        match update {
            SessionUpdate::ChannelReady if !sending => {
                let source = FileSource::open(file_path).await?;
                eprintln!("Sending {} ({})...", source.name, format_bytes(source.size));
                handle.send_file(source)?;
                sending = true;
            }
            SessionUpdate::PeerReady => {
                log::debug!("Receiver reports its channel open");
            }
            SessionUpdate::SendProgress(p) => progress.update("Sending", &p),
            SessionUpdate::SendComplete(meta) => {
                progress.finish();
                eprintln!("Sent {} ({} chunks)", meta.name, meta.total_chunks);
                wait_for_peer_close(&mut updates).await;
                eprintln!("Transfer complete!");
                return Ok(());
            }
            SessionUpdate::SessionFailed { reason } => {
                progress.finish();
                sending = false;
                if !prompt_reconnect(&reason).await? {
                    anyhow::bail!("WebRTC connection failed: {}", reason);
                }
                handle.reconnect()?;
            }
            _ => {}
        }
    }

    anyhow::bail!("Session ended before the transfer completed")
}

/// Let the receiver acknowledge by closing its side, bounded by a timeout
async fn wait_for_peer_close(updates: &mut mpsc::UnboundedReceiver<SessionUpdate>) {
    let closed = timeout(PEER_CLOSE_TIMEOUT, async {
        while let Some(update) = updates.recv().await {
            match update {
                SessionUpdate::Phase(phase) if phase != ConnectionPhase::Connected => return,
                SessionUpdate::SessionFailed { .. } => return,
                _ => {}
            }
        }
    })
    .await;

    if closed.is_err() {
        log::debug!("Receiver did not close within {:?}", PEER_CLOSE_TIMEOUT);
    }
}
