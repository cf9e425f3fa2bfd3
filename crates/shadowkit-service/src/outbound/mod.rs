//! Outbound connection handlers
//!
//! `DirectHandler` connects destinations from this host. `ShadowsocksHandler` and `TrojanHandler`
//! tunnel connections through a remote server, which turns an inbound into a local proxy client.

pub use self::{direct::DirectHandler, shadowsocks::ShadowsocksHandler, trojan::TrojanHandler};

mod direct;
mod shadowsocks;
mod trojan;
