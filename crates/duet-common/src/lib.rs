//! duet-common: peer-to-peer file transfer core
//!
//! Session coordination, NAT classification and the chunked transfer
//! protocol. Transport, relay and disk access are consumed through traits so
//! the binaries can plug in webrtc-rs, Nostr and the local filesystem.

pub mod core;
pub mod nat;
pub mod session;
pub mod signaling;
