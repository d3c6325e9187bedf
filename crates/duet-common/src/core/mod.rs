pub mod receive;
pub mod room;
pub mod sink;
pub mod transfer;
