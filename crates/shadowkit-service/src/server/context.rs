//! Context shared by inbound servers

use std::sync::Arc;

use shadowkit::{
    config::{ReplayAttackPolicy, ServerType},
    context::{Context, SharedContext},
    net::AcceptOpts,
};

use crate::handler::ConnectionHandler;

/// Server Service Context
#[derive(Clone)]
pub struct ServiceContext {
    context: SharedContext,
    accept_opts: AcceptOpts,
    handler: Arc<dyn ConnectionHandler>,
}

impl ServiceContext {
    /// Create a new `ServiceContext` delivering connections to `handler`
    pub fn new(handler: Arc<dyn ConnectionHandler>) -> ServiceContext {
        ServiceContext {
            context: Context::new_shared(ServerType::Server),
            accept_opts: AcceptOpts::default(),
            handler,
        }
    }

    /// Get cloned `shadowkit` Context
    pub fn context(&self) -> SharedContext {
        self.context.clone()
    }

    /// Get `shadowkit` Context reference
    pub fn context_ref(&self) -> &Context {
        self.context.as_ref()
    }

    pub fn handler(&self) -> &Arc<dyn ConnectionHandler> {
        &self.handler
    }

    pub fn set_accept_opts(&mut self, accept_opts: AcceptOpts) {
        self.accept_opts = accept_opts;
    }

    pub fn accept_opts(&self) -> &AcceptOpts {
        &self.accept_opts
    }

    /// Set replay attack policy of Shadowsocks inbounds
    ///
    /// Takes a fresh replay filter if the current context is already shared.
    pub fn set_replay_attack_policy(&mut self, policy: ReplayAttackPolicy) {
        match Arc::get_mut(&mut self.context) {
            Some(context) => context.set_replay_attack_policy(policy),
            None => {
                let mut context = Context::new(ServerType::Server);
                context.set_replay_attack_policy(policy);
                self.context = Arc::new(context);
            }
        }
    }
}
