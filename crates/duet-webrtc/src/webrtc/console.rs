//! Terminal output shared by the send and receive commands

use anyhow::{Context, Result};
use std::io::Write;
use tokio::io::AsyncBufReadExt;
use tokio::time::{timeout, Duration};

use duet_common::core::transfer::{calc_percent, format_bytes, TransferPhase, TransferProgress};
use duet_common::session::SessionUpdate;

/// How long the reconnect prompt waits for the user
const RECONNECT_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Single-line progress display, redrawn only when the percentage moves
#[derive(Debug, Default)]
pub struct ProgressLine {
    last_percent: Option<u32>,
}

impl ProgressLine {
    pub fn update(&mut self, label: &str, progress: &TransferProgress) {
        let percent = calc_percent(progress.bytes_moved, progress.total) as u32;
        if self.last_percent == Some(percent) && progress.phase != TransferPhase::Complete {
            return;
        }
        self.last_percent = Some(percent);

        eprint!(
            "\r   {}: {}% ({}/{})",
            label,
            percent,
            format_bytes(progress.bytes_moved),
            format_bytes(progress.total)
        );
        let _ = std::io::stderr().flush();
    }

    /// End the progress line, if one was drawn
    pub fn finish(&mut self) {
        if self.last_percent.take().is_some() {
            eprintln!();
        }
    }
}

/// Print connection-level updates common to both roles.
///
/// Returns true if the update was handled here.
pub fn report(update: &SessionUpdate, progress: &mut ProgressLine) -> bool {
    match update {
        SessionUpdate::Status(status) => {
            progress.finish();
            eprintln!("{}", status);
        }
        SessionUpdate::NatDetected(nat) => {
            eprintln!("Network: {}", nat.description());
        }
        SessionUpdate::RelayState(state) => {
            log::debug!("Signaling relays {}", state);
        }
        SessionUpdate::Phase(phase) => {
            log::debug!("Connection phase: {}", phase);
        }
        SessionUpdate::TransferFailed { reason, retryable } => {
            progress.finish();
            if *retryable {
                eprintln!("Transfer interrupted: {} (will retry on reconnect)", reason);
            } else {
                eprintln!("Transfer failed: {}", reason);
            }
        }
        _ => return false,
    }
    true
}

/// Ask whether to start over after the session failed.
///
/// Returns Ok(true) when the user pressed Enter, Ok(false) on end of input.
pub async fn prompt_reconnect(reason: &str) -> Result<bool> {
    eprintln!("\nConnection failed: {}", reason);
    eprintln!("Press Enter to reconnect, or Ctrl+C to abort...");

    let stdin = tokio::io::stdin();
    let mut reader = tokio::io::BufReader::new(stdin);
    let mut line = String::new();
    match timeout(RECONNECT_PROMPT_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(0)) => Ok(false),
        Ok(Ok(_)) => Ok(true),
        Ok(Err(e)) => Err(e).context("Failed to read user input"),
        Err(_) => anyhow::bail!(
            "Timed out waiting for user input ({:?}). Aborting.",
            RECONNECT_PROMPT_TIMEOUT
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_common::nat::NatCategory;

    #[test]
    fn test_progress_line_skips_unchanged_percent() {
        let mut line = ProgressLine::default();
        let mut progress = TransferProgress::started(1000);

        progress.bytes_moved = 500;
        line.update("Sending", &progress);
        assert_eq!(line.last_percent, Some(50));

        progress.bytes_moved = 504;
        line.update("Sending", &progress);
        assert_eq!(line.last_percent, Some(50));

        line.finish();
        assert_eq!(line.last_percent, None);
    }

    #[test]
    fn test_report_leaves_transfer_updates_to_caller() {
        let mut line = ProgressLine::default();
        assert!(report(&SessionUpdate::NatDetected(NatCategory::Cone), &mut line));
        assert!(!report(&SessionUpdate::ChannelReady, &mut line));
        assert!(!report(&SessionUpdate::PeerReady, &mut line));
    }
}
