use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current room code format version
pub const CURRENT_VERSION: u8 = 1;

/// TTL for room codes in seconds (30 minutes)
pub const CODE_TTL_SECS: u64 = 30 * 60;

/// Allowed clock skew for codes created "in the future"
const FUTURE_SKEW_SECS: u64 = 60;

/// Everything a receiver needs to find the sender's room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomCode {
    /// Format version (for future compatibility checks)
    pub version: u8,
    /// Room topic shared by both peers on the relay
    pub room: String,
    /// Relay URLs the sender is listening on (None = default relays)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relays: Option<Vec<String>>,
    /// Unix timestamp when the code was created
    pub created_at: u64,
}

fn current_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock is set before Unix epoch")?
        .as_secs())
}

/// Generate a random room id (16 bytes, hex encoded)
pub fn generate_room_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

fn validate_relays(relays: &[String]) -> Result<()> {
    if relays.is_empty() {
        anyhow::bail!("Invalid relays: list cannot be empty if provided");
    }
    for relay in relays {
        if !relay.starts_with("ws://") && !relay.starts_with("wss://") {
            anyhow::bail!(
                "Invalid relay URL '{}': must start with ws:// or wss://",
                relay
            );
        }
    }
    Ok(())
}

/// Generate a room code.
/// Format: base64url(json(RoomCode))
pub fn generate_room_code(room: &str, relays: Option<Vec<String>>) -> Result<String> {
    if room.trim().is_empty() {
        anyhow::bail!("Invalid room: cannot be empty");
    }
    if let Some(ref relay_list) = relays {
        validate_relays(relay_list)?;
    }

    let code = RoomCode {
        version: CURRENT_VERSION,
        room: room.to_string(),
        relays,
        created_at: current_timestamp()?,
    };

    let serialized = serde_json::to_vec(&code).context("Failed to serialize room code")?;
    Ok(URL_SAFE_NO_PAD.encode(serialized))
}

/// Parse and validate a room code
pub fn parse_room_code(code: &str) -> Result<RoomCode> {
    let code = code.trim();
    if code.is_empty() {
        anyhow::bail!("Room code cannot be empty");
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!("Invalid room code: contains invalid characters. Expected base64url-encoded string.");
    }

    let serialized = URL_SAFE_NO_PAD
        .decode(code)
        .context("Invalid room code: not valid base64url encoding")?;
    let parsed: RoomCode = serde_json::from_slice(&serialized)
        .context("Invalid room code: make sure you copied the entire code")?;

    if parsed.version != CURRENT_VERSION {
        anyhow::bail!(
            "Unsupported room code version {}. This build requires version {}.",
            parsed.version,
            CURRENT_VERSION
        );
    }
    if parsed.room.trim().is_empty() {
        anyhow::bail!("Invalid room code: missing room");
    }
    if let Some(ref relays) = parsed.relays {
        validate_relays(relays).context("Invalid room code")?;
    }

    check_age(parsed.created_at, current_timestamp()?)?;
    Ok(parsed)
}

fn check_age(created_at: u64, now: u64) -> Result<()> {
    if created_at > now + FUTURE_SKEW_SECS {
        anyhow::bail!("Invalid room code: created_at is in the future. Check system clock.");
    }
    let age = now.saturating_sub(created_at);
    if age > CODE_TTL_SECS {
        anyhow::bail!(
            "Room code expired: code is {} minutes old (max {} minutes). \
             Please request a new code from the sender.",
            age / 60,
            CODE_TTL_SECS / 60
        );
    }
    Ok(())
}
