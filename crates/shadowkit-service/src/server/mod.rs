//! Inbound servers

use std::{io, sync::Arc};

use futures::{future, future::BoxFuture, FutureExt};
use log::trace;

use crate::{
    config::{Config, InboundConfig},
    handler::ConnectionHandler,
    mixed::MixedServer,
    socks::Socks5Server,
    utils::ServerHandle,
};

pub use self::{
    context::ServiceContext,
    server::Server,
    tcprelay::TcpServer,
    trojan::{serve_stream as serve_trojan_stream, TrojanServer},
    udprelay::UdpServer,
};

pub mod context;
#[allow(clippy::module_inception)]
mod server;
mod tcprelay;
mod trojan;
mod udprelay;

/// Starts every inbound in `config`, handing accepted connections to `handler`
///
/// Returns when any of the inbounds fails.
pub async fn run(config: Config, handler: Arc<dyn ConnectionHandler>) -> io::Result<()> {
    trace!("{:?}", config);

    if config.inbounds.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "no inbound is configured"));
    }

    let mut context = ServiceContext::new(handler);
    context.set_replay_attack_policy(config.replay_attack_policy);
    let context = Arc::new(context);

    let mut servers: Vec<BoxFuture<'static, io::Result<()>>> = Vec::with_capacity(config.inbounds.len());

    for inbound in config.inbounds {
        let server = match inbound {
            InboundConfig::Socks(c) => Socks5Server::new(context.clone(), &c).await?.run().boxed(),
            InboundConfig::Mixed(c) => MixedServer::new(context.clone(), &c).await?.run().boxed(),
            InboundConfig::Shadowsocks(svr_cfg) => {
                let mut server = Server::new(context.clone(), svr_cfg);
                if let Some(d) = config.udp_timeout {
                    server.set_udp_expiry_duration(d);
                }
                if let Some(c) = config.udp_max_associations {
                    server.set_udp_capacity(c);
                }
                server.run().boxed()
            }
            InboundConfig::Trojan(c) => TrojanServer::new(context.clone(), &c.listen, c.users)
                .await?
                .run()
                .boxed(),
        };
        servers.push(server);
    }

    if servers.len() == 1 {
        if let Some(server) = servers.pop() {
            return server.await;
        }
    }

    let vfut = servers.into_iter().map(|server| ServerHandle(tokio::spawn(server)));

    let (res, ..) = future::select_all(vfut).await;
    res
}
