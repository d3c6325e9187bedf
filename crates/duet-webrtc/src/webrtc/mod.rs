//! WebRTC transport for peer-to-peer file transfer

pub mod channel;
pub mod common;
pub mod console;
pub mod receiver;
pub mod sender;

pub use receiver::{receive_webrtc, ReceiveOptions};
pub use sender::{send_file_webrtc, SendOptions};
