//! Protections against replayed handshakes and packets

pub mod packet_window;
pub mod replay;
