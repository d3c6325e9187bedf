//! Signaling relays for the WebRTC transport

pub mod nostr;
