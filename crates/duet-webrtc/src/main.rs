//! duet-webrtc: peer-to-peer file transfer over WebRTC data channels
//!
//! Peers meet in a room on Nostr relays, exchange offers, answers and ICE
//! candidates there, then move the file over an ordered data channel.
//! Lost connections are restarted automatically with NAT-aware backoff.
//!
//! Build with: cargo build -p duet-webrtc

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;

use duet_common::core::transfer::{is_interrupted, DEFAULT_CHUNK_SIZE};

mod signaling;
mod webrtc;

use crate::webrtc::common::{IceConfig, TurnServer};

#[derive(Parser)]
#[command(name = "duet-webrtc")]
#[command(about = "Peer-to-peer file transfer using WebRTC with Nostr signaling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Use verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// ICE server options shared by both commands
#[derive(Args, Debug, Clone)]
struct IceArgs {
    /// STUN server URLs (can be specified multiple times; defaults to Google STUN)
    #[arg(long = "stun", value_name = "URL")]
    stun: Vec<String>,

    /// TURN server URL, e.g. turn:turn.example.org:3478
    #[arg(long, value_name = "URL", requires_all = ["turn_username", "turn_credential"])]
    turn_url: Option<String>,

    /// TURN username
    #[arg(long, value_name = "NAME")]
    turn_username: Option<String>,

    /// TURN credential
    #[arg(long, value_name = "SECRET")]
    turn_credential: Option<String>,
}

impl IceArgs {
    fn into_config(self) -> IceConfig {
        let mut config = IceConfig::default();
        if !self.stun.is_empty() {
            config.stun_urls = self.stun;
        }
        if let (Some(url), Some(username), Some(credential)) =
            (self.turn_url, self.turn_username, self.turn_credential)
        {
            config.turn = Some(TurnServer {
                url,
                username,
                credential,
            });
        }
        config
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file
    Send {
        /// Path to the file to send
        path: PathBuf,

        /// Custom Nostr relay URLs (can be specified multiple times)
        #[arg(long, value_name = "URL")]
        relay: Vec<String>,

        /// Bytes per data channel message
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Only send candidates inline with the offer (no separate ice-batch)
        #[arg(long)]
        no_ice_batch: bool,

        #[command(flatten)]
        ice: IceArgs,
    },

    /// Receive a file
    Receive {
        /// Room code from sender (will prompt if not provided)
        code: Option<String>,

        /// Output directory (defaults to current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Buffer the file in memory instead of streaming it to disk
        #[arg(long)]
        memory: bool,

        #[command(flatten)]
        ice: IceArgs,
    },
}

fn main() {
    // Run the async main and handle errors
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main()) {
        // Check if this was an interrupt (Ctrl+C)
        if is_interrupted(&e) {
            // Exit with 128 + SIGINT (2) = 130, standard Unix convention
            std::process::exit(130);
        }
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

async fn async_main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with filters for noisy internal modules
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = format!(
        "{},webrtc_ice=error,webrtc_sctp=warn,nostr_relay_pool=warn",
        log_level
    );
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&filter)).init();

    match cli.command {
        Commands::Send {
            path,
            relay,
            chunk_size,
            no_ice_batch,
            ice,
        } => {
            let options = webrtc::SendOptions {
                relays: relay,
                chunk_size,
                ice_batch: !no_ice_batch,
                ice: ice.into_config(),
            };
            webrtc::send_file_webrtc(&path, options).await?;
        }

        Commands::Receive {
            code,
            output,
            memory,
            ice,
        } => {
            let code = match code {
                Some(c) => c.trim().to_string(),
                None => {
                    print!("Enter room code: ");
                    io::stdout().flush()?;
                    let mut input = String::new();
                    io::stdin().read_line(&mut input)?;
                    input.trim().to_string()
                }
            };

            if code.is_empty() {
                anyhow::bail!("Room code is required");
            }

            let options = webrtc::ReceiveOptions {
                output_dir: output,
                in_memory: memory,
                ice: ice.into_config(),
            };
            webrtc::receive_webrtc(&code, options).await?;
        }
    }

    Ok(())
}
