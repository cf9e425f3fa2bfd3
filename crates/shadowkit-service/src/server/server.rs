//! Shadowsocks Server instance

use std::{io, sync::Arc, time::Duration};

use futures::{future, FutureExt};
use shadowkit::ServerConfig;

use super::{context::ServiceContext, tcprelay::TcpServer, udprelay::UdpServer};

/// Shadowsocks inbound, serving TCP and UDP as its `Mode` enables
pub struct Server {
    context: Arc<ServiceContext>,
    svr_cfg: ServerConfig,
    udp_expiry_duration: Option<Duration>,
    udp_capacity: Option<usize>,
}

impl Server {
    pub fn new(context: Arc<ServiceContext>, svr_cfg: ServerConfig) -> Server {
        Server {
            context,
            svr_cfg,
            udp_expiry_duration: None,
            udp_capacity: None,
        }
    }

    pub fn set_udp_expiry_duration(&mut self, d: Duration) {
        self.udp_expiry_duration = Some(d);
    }

    pub fn set_udp_capacity(&mut self, c: usize) {
        self.udp_capacity = Some(c);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.svr_cfg
    }

    /// Bind the listeners, then serve until one of them fails
    pub async fn run(self) -> io::Result<()> {
        #[cfg(feature = "stream-cipher")]
        if self.svr_cfg.method().is_stream() {
            log::warn!(
                "stream cipher {} for server {} has inherent weaknesses, DO NOT USE",
                self.svr_cfg.method(),
                self.svr_cfg.addr()
            );
        }

        let mode = self.svr_cfg.mode();
        let mut vfut = Vec::new();

        if mode.enable_tcp() {
            let server = TcpServer::new(self.context.clone(), &self.svr_cfg).await?;
            vfut.push(server.run().boxed());
        }

        if mode.enable_udp() {
            let server = UdpServer::new(
                self.context.clone(),
                &self.svr_cfg,
                self.udp_expiry_duration,
                self.udp_capacity,
            )
            .await?;
            vfut.push(server.run().boxed());
        }

        let (res, ..) = future::select_all(vfut).await;
        match res {
            Ok(()) => Err(io::Error::other("server exited unexpectedly")),
            Err(err) => Err(err),
        }
    }
}
