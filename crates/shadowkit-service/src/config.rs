//! Configuration of the service
//!
//! Configuration is a JSON document, for example
//!
//! ```json
//! {
//!     "log": {
//!         "level": 1,
//!         "format": { "without_time": false }
//!     },
//!     "udp_timeout": 300,
//!     "udp_max_associations": 512,
//!     "security": { "replay_attack": { "policy": "reject" } },
//!     "inbounds": [
//!         {
//!             "type": "mixed",
//!             "listen": "127.0.0.1:1080",
//!             "users": [{ "name": "alice", "password": "secret" }]
//!         },
//!         {
//!             "type": "shadowsocks",
//!             "listen": "0.0.0.0:8388",
//!             "method": "2022-blake3-aes-128-gcm",
//!             "password": "base64 encoded iPSK",
//!             "mode": "tcp_and_udp",
//!             "users": [{ "name": "bob", "password": "base64 encoded uPSK" }]
//!         },
//!         {
//!             "type": "trojan",
//!             "listen": "0.0.0.0:8443",
//!             "users": [{ "name": "carol", "password": "hunter2" }]
//!         }
//!     ]
//! }
//! ```

use std::{
    fs::OpenOptions,
    io::{self, Read},
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use shadowkit::{
    config::{Mode, ReplayAttackPolicy, ServerConfig, ServerUser, ServerUserManager},
    crypto::CipherKind,
    relay::trojan::{TrojanUser, TrojanUserManager},
};

use crate::socks::config::Socks5AuthConfig;

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSLogFormat {
    #[serde(skip_serializing_if = "Option::is_none")]
    without_time: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSLogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    level: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<SSLogFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    config_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSSecurityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    replay_attack: Option<SSSecurityReplayAttackConfig>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSSecurityReplayAttackConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    policy: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
struct SSUserConfig {
    name: String,
    password: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct SSInboundConfig {
    #[serde(rename = "type")]
    protocol: String,
    listen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    users: Option<Vec<SSUserConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    udp_bind_addr: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SSConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    log: Option<SSLogConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    udp_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    udp_max_associations: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    security: Option<SSSecurityConfig>,
    #[serde(default)]
    inbounds: Vec<SSInboundConfig>,
}

/// Configuration parsing error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error while reading file, {0}")]
    IoError(#[from] io::Error),
    #[error("json parse error, {0}")]
    JsonParsingError(#[from] serde_json::Error),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid `{0}`, {1}")]
    Invalid(&'static str, String),
}

/// Log output format
#[derive(Debug, Clone, Default)]
pub struct LogFormatConfig {
    pub without_time: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Verbosity, 0 is `info`, 1 is `debug`, 2 is `trace` and 3 also enables `debug` for every other crate
    pub level: u32,
    pub format: LogFormatConfig,
    /// log4rs YAML file, overrides everything above if set
    pub config_path: Option<PathBuf>,
}

/// A SOCKS5 or mixed inbound
#[derive(Debug, Clone)]
pub struct SocksInboundConfig {
    pub listen: SocketAddr,
    pub auth: Arc<Socks5AuthConfig>,
    pub mode: Mode,
    /// IP address to bind UDP ASSOCIATE sockets, the listen address' IP if not set
    pub udp_bind_addr: Option<IpAddr>,
}

/// A Trojan inbound, serving streams already unwrapped from TLS
#[derive(Debug, Clone)]
pub struct TrojanInboundConfig {
    pub listen: SocketAddr,
    pub users: Arc<TrojanUserManager>,
}

/// Inbound listeners
#[derive(Debug, Clone)]
pub enum InboundConfig {
    Socks(SocksInboundConfig),
    Mixed(SocksInboundConfig),
    Shadowsocks(ServerConfig),
    Trojan(TrojanInboundConfig),
}

/// Service configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub inbounds: Vec<InboundConfig>,
    pub log: LogConfig,
    /// Idle time of UDP associations
    pub udp_timeout: Option<Duration>,
    /// Maximum number of UDP associations of each UDP inbound
    pub udp_max_associations: Option<usize>,
    pub replay_attack_policy: ReplayAttackPolicy,
}

fn parse_listen(listen: &str) -> Result<SocketAddr, Error> {
    listen
        .parse::<SocketAddr>()
        .map_err(|err| Error::Invalid("listen", format!("{listen}, {err}")))
}

fn parse_mode(mode: Option<&str>) -> Result<Mode, Error> {
    match mode {
        None => Ok(Mode::TcpAndUdp),
        Some(m) => m.parse::<Mode>().map_err(|err| Error::Invalid("mode", err.to_string())),
    }
}

impl Config {
    fn load_from_ssconfig(config: SSConfig) -> Result<Config, Error> {
        let mut nconfig = Config::default();

        if let Some(log) = config.log {
            nconfig.log.level = log.level.unwrap_or(0);
            if let Some(format) = log.format {
                nconfig.log.format.without_time = format.without_time.unwrap_or(false);
            }
            nconfig.log.config_path = log.config_path.map(PathBuf::from);
        }

        nconfig.udp_timeout = config.udp_timeout.map(Duration::from_secs);
        nconfig.udp_max_associations = config.udp_max_associations;

        if let Some(policy) = config
            .security
            .and_then(|s| s.replay_attack)
            .and_then(|r| r.policy)
        {
            nconfig.replay_attack_policy = ReplayAttackPolicy::from_str(&policy)
                .map_err(|_| Error::Invalid("security.replay_attack.policy", policy))?;
        }

        for inbound in config.inbounds {
            let inbound = match inbound.protocol.as_str() {
                "socks" | "socks5" => InboundConfig::Socks(Config::load_socks_inbound(inbound)?),
                "mixed" => InboundConfig::Mixed(Config::load_socks_inbound(inbound)?),
                "shadowsocks" | "ss" => InboundConfig::Shadowsocks(Config::load_shadowsocks_inbound(inbound)?),
                "trojan" => InboundConfig::Trojan(Config::load_trojan_inbound(inbound)?),
                p => return Err(Error::Invalid("type", p.to_owned())),
            };
            nconfig.inbounds.push(inbound);
        }

        Ok(nconfig)
    }

    fn load_socks_inbound(inbound: SSInboundConfig) -> Result<SocksInboundConfig, Error> {
        let mut auth = Socks5AuthConfig::new();
        for user in inbound.users.unwrap_or_default() {
            auth.passwd.add_user(user.name, user.password);
        }

        let udp_bind_addr = match inbound.udp_bind_addr {
            None => None,
            Some(addr) => Some(
                addr.parse::<IpAddr>()
                    .map_err(|err| Error::Invalid("udp_bind_addr", format!("{addr}, {err}")))?,
            ),
        };

        Ok(SocksInboundConfig {
            listen: parse_listen(&inbound.listen)?,
            auth: Arc::new(auth),
            mode: parse_mode(inbound.mode.as_deref())?,
            udp_bind_addr,
        })
    }

    fn load_shadowsocks_inbound(inbound: SSInboundConfig) -> Result<ServerConfig, Error> {
        let listen = parse_listen(&inbound.listen)?;

        let method = match inbound.method {
            Some(m) => m
                .parse::<CipherKind>()
                .map_err(|err| Error::Invalid("method", err.to_string()))?,
            None => return Err(Error::MissingField("method")),
        };
        let password = match inbound.password {
            Some(p) => p,
            None => return Err(Error::MissingField("password")),
        };

        let mut svr_cfg = ServerConfig::new(listen, password, method)
            .map_err(|err| Error::Invalid("password", err.to_string()))?;
        svr_cfg.set_mode(parse_mode(inbound.mode.as_deref())?);
        if let Some(timeout) = inbound.timeout {
            svr_cfg.set_timeout(Duration::from_secs(timeout));
        }

        if let Some(users) = inbound.users {
            let user_manager = ServerUserManager::new();
            for user in users {
                let user = ServerUser::with_encoded_key(user.name, &user.password)
                    .map_err(|err| Error::Invalid("users", err.to_string()))?;
                user_manager.add_user(user);
            }
            svr_cfg
                .set_user_manager(Arc::new(user_manager))
                .map_err(|err| Error::Invalid("users", err.to_string()))?;
        }

        Ok(svr_cfg)
    }

    fn load_trojan_inbound(inbound: SSInboundConfig) -> Result<TrojanInboundConfig, Error> {
        let users = TrojanUserManager::new();
        match inbound.users {
            Some(list) if !list.is_empty() => {
                for user in list {
                    users.add_user(TrojanUser::new(user.name, &user.password));
                }
            }
            _ => match inbound.password {
                Some(password) => users.add_user(TrojanUser::new("default", &password)),
                None => return Err(Error::MissingField("users")),
            },
        }

        Ok(TrojanInboundConfig {
            listen: parse_listen(&inbound.listen)?,
            users: Arc::new(users),
        })
    }

    /// Load `Config` from a JSON string
    pub fn load_from_str(s: &str) -> Result<Config, Error> {
        let c = serde_json::from_str::<SSConfig>(s)?;
        Config::load_from_ssconfig(c)
    }

    /// Load `Config` from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(filename: P) -> Result<Config, Error> {
        let mut reader = OpenOptions::new().read(true).open(filename.as_ref())?;
        let mut content = String::new();
        reader.read_to_string(&mut content)?;

        Config::load_from_str(&content)
    }

    /// Check if there is anything to run
    pub fn check_integrity(&self) -> Result<(), Error> {
        if self.inbounds.is_empty() {
            return Err(Error::MissingField("inbounds"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_inbounds() {
        let config = Config::load_from_str(
            r#"{
                "log": { "level": 2, "format": { "without_time": true } },
                "udp_timeout": 60,
                "security": { "replay_attack": { "policy": "detect" } },
                "inbounds": [
                    { "type": "mixed", "listen": "127.0.0.1:1080", "users": [{ "name": "u", "password": "p" }] },
                    { "type": "shadowsocks", "listen": "0.0.0.0:8388", "method": "aes-128-gcm", "password": "pwd", "mode": "tcp_only" },
                    { "type": "trojan", "listen": "0.0.0.0:8443", "password": "hunter2" }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.log.level, 2);
        assert!(config.log.format.without_time);
        assert_eq!(config.udp_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.replay_attack_policy, ReplayAttackPolicy::Detect);
        assert_eq!(config.inbounds.len(), 3);

        match config.inbounds[0] {
            InboundConfig::Mixed(ref c) => {
                assert!(c.auth.auth_required());
                assert!(c.auth.passwd.check_user("u", "p"));
            }
            ref c => panic!("unexpected {c:?}"),
        }
        match config.inbounds[1] {
            InboundConfig::Shadowsocks(ref c) => {
                assert_eq!(c.method(), CipherKind::AES_128_GCM);
                assert_eq!(c.mode(), Mode::TcpOnly);
            }
            ref c => panic!("unexpected {c:?}"),
        }
        match config.inbounds[2] {
            InboundConfig::Trojan(ref c) => assert_eq!(c.users.user_count(), 1),
            ref c => panic!("unexpected {c:?}"),
        }
    }

    #[test]
    fn reject_chacha_2022_with_identity_keys() {
        let err = Config::load_from_str(
            r#"{
                "inbounds": [{
                    "type": "shadowsocks",
                    "listen": "0.0.0.0:8388",
                    "method": "2022-blake3-chacha20-poly1305",
                    "password": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
                }]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invalid("password", ..)));
    }

    #[test]
    fn unknown_inbound_type() {
        let err = Config::load_from_str(r#"{ "inbounds": [{ "type": "vmess", "listen": "0.0.0.0:1" }] }"#).unwrap_err();
        assert!(matches!(err, Error::Invalid("type", ..)));
    }
}
