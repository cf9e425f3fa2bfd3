//! Trojan server side handshake and user table

use std::{collections::HashMap, fmt, sync::Arc};

use log::trace;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::relay::Address;

use super::{
    password_to_key,
    protocol::{Command, RequestHeader},
    Error,
    KEY_LEN,
};

/// A Trojan user, identified by the key of its password
#[derive(Clone)]
pub struct TrojanUser {
    name: String,
    key: [u8; KEY_LEN],
}

impl fmt::Debug for TrojanUser {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TrojanUser").field("name", &self.name).finish()
    }
}

impl TrojanUser {
    pub fn new<N: Into<String>>(name: N, password: &str) -> TrojanUser {
        TrojanUser {
            name: name.into(),
            key: password_to_key(password),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

/// Password table of a Trojan server
#[derive(Debug, Default)]
pub struct TrojanUserManager {
    users: spin::RwLock<HashMap<[u8; KEY_LEN], Arc<TrojanUser>>>,
}

impl TrojanUserManager {
    pub fn new() -> TrojanUserManager {
        TrojanUserManager::default()
    }

    /// Add a user, replacing the one with the same password
    pub fn add_user(&self, user: TrojanUser) {
        self.users.write().insert(user.key, Arc::new(user));
    }

    /// Remove a user by name
    pub fn remove_user(&self, name: &str) -> Option<Arc<TrojanUser>> {
        let mut users = self.users.write();
        let key = users.iter().find(|(_, u)| u.name == name).map(|(k, _)| *k)?;
        users.remove(&key)
    }

    pub fn get_user_by_key(&self, key: &[u8]) -> Option<Arc<TrojanUser>> {
        self.users.read().get(key).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }
}

/// An authenticated Trojan request
#[derive(Debug)]
pub struct TrojanInbound<S> {
    pub stream: S,
    pub user: Arc<TrojanUser>,
    pub command: Command,
    pub address: Address,
}

/// Accepts Trojan requests on streams already unwrapped from TLS
#[derive(Debug, Clone)]
pub struct TrojanAcceptor {
    users: Arc<TrojanUserManager>,
}

impl TrojanAcceptor {
    pub fn new(users: Arc<TrojanUserManager>) -> TrojanAcceptor {
        TrojanAcceptor { users }
    }

    pub fn users(&self) -> &TrojanUserManager {
        &self.users
    }

    /// Read and verify the request header of `stream`
    ///
    /// Fails with `Error::UnknownKey` without reading past the key if it matches no user. Nothing is
    /// ever written to `stream`, the caller closes it on errors.
    pub async fn accept<S>(&self, mut stream: S) -> Result<TrojanInbound<S>, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let key = RequestHeader::read_key(&mut stream).await?;
        let user = match self.users.get_user_by_key(&key) {
            Some(user) => user,
            None => return Err(Error::UnknownKey),
        };

        let header = RequestHeader::read_after_key(key, &mut stream).await?;
        trace!(
            "trojan user {} request {:?} {}",
            user.name(),
            header.command,
            header.address
        );

        Ok(TrojanInbound {
            stream,
            user,
            command: header.command,
            address: header.address,
        })
    }
}
