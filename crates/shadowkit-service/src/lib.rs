//! Proxy inbound services
//!
//! SOCKS5, mixed SOCKS5/HTTP, Shadowsocks and Trojan listeners built on `shadowkit`. Each inbound
//! performs its protocol handshake, then hands the connection to a
//! [`ConnectionHandler`](handler::ConnectionHandler), which decides where the traffic goes.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use shadowkit_service::{config::Config, outbound::DirectHandler};
//!
//! # async fn serve() -> std::io::Result<()> {
//! let config = Config::load_from_file("config.json").map_err(std::io::Error::other)?;
//! shadowkit_service::run(config, Arc::new(DirectHandler::new())).await
//! # }
//! ```

use std::time::Duration;

pub use self::server::run;
pub use shadowkit;

pub mod config;
pub mod handler;
#[cfg(feature = "logging")]
pub mod logging;
pub mod mixed;
pub mod outbound;
pub mod server;
pub mod socks;
pub mod stream_packet;
pub mod utils;

/// Default UDP association's expire duration
pub const DEFAULT_UDP_EXPIRY_DURATION: Duration = Duration::from_secs(5 * 60);
