//! SOCKS5 inbound authentication

use std::collections::HashMap;

/// SOCKS5 authentication methods offered by an inbound
#[derive(Debug, Clone, Default)]
pub struct Socks5AuthConfig {
    pub passwd: Socks5AuthPasswdConfig,
}

impl Socks5AuthConfig {
    pub fn new() -> Socks5AuthConfig {
        Socks5AuthConfig::default()
    }

    /// Clients must authenticate if any user is configured
    pub fn auth_required(&self) -> bool {
        self.passwd.total_users() > 0
    }
}

/// Username/Password credentials
///
/// RFC1929 https://datatracker.ietf.org/doc/html/rfc1929
#[derive(Debug, Clone, Default)]
pub struct Socks5AuthPasswdConfig {
    passwd: HashMap<String, String>,
}

impl Socks5AuthPasswdConfig {
    pub fn new() -> Socks5AuthPasswdConfig {
        Socks5AuthPasswdConfig::default()
    }

    /// Add a user, replacing the password of an existing one
    pub fn add_user<U, P>(&mut self, user_name: U, password: P)
    where
        U: Into<String>,
        P: Into<String>,
    {
        self.passwd.insert(user_name.into(), password.into());
    }

    /// Check if `user_name` exists with `password`
    pub fn check_user<U, P>(&self, user_name: U, password: P) -> bool
    where
        U: AsRef<str>,
        P: AsRef<str>,
    {
        self.passwd
            .get(user_name.as_ref())
            .is_some_and(|pwd| pwd == password.as_ref())
    }

    pub fn total_users(&self) -> usize {
        self.passwd.len()
    }
}
