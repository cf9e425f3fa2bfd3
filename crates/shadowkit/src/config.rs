//! Server and user configuration, shared by both ends of a connection

use std::{
    collections::HashMap,
    fmt,
    net::IpAddr,
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use byte_string::ByteStr;
use bytes::Bytes;
use log::debug;
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use thiserror::Error;
use url::Url;

use crate::{
    crypto::{openssl_bytes_to_key, v2::identity_hash, CipherCategory, CipherKind},
    relay::Address,
};

/// PSKs are written with padding, either form is read
const PSK_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Userinfo of legacy `ss://` URLs
const USERINFO_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Port of a `ss://` URL without one
const DEFAULT_URL_PORT: u16 = 8388;

/// Enums spelled the same way in configuration files and in `Display`
trait Named: Copy + 'static {
    const NAMES: &'static [(Self, &'static str)];

    fn name(self) -> &'static str
    where
        Self: PartialEq,
    {
        Self::NAMES
            .iter()
            .find(|(v, _)| *v == self)
            .map_or("", |(_, name)| name)
    }

    fn from_name(s: &str) -> Option<Self> {
        Self::NAMES.iter().find(|(_, name)| *name == s).map(|(v, _)| *v)
    }
}

/// Which end of a connection the configuration is used for
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServerType {
    /// Dials servers
    Local,
    /// Accepts clients
    Server,
}

impl ServerType {
    pub fn is_local(self) -> bool {
        matches!(self, ServerType::Local)
    }

    pub fn is_server(self) -> bool {
        matches!(self, ServerType::Server)
    }
}

/// Transports a server listens on
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    TcpOnly,
    UdpOnly,
    TcpAndUdp,
}

impl Named for Mode {
    const NAMES: &'static [(Mode, &'static str)] = &[
        (Mode::TcpOnly, "tcp_only"),
        (Mode::UdpOnly, "udp_only"),
        (Mode::TcpAndUdp, "tcp_and_udp"),
    ];
}

impl Mode {
    pub fn enable_tcp(self) -> bool {
        self != Mode::UdpOnly
    }

    pub fn enable_udp(self) -> bool {
        self != Mode::TcpOnly
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid mode \"{0}\", expecting tcp_only, udp_only or tcp_and_udp")]
pub struct ModeError(String);

impl FromStr for Mode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Mode, ModeError> {
        Mode::from_name(s).ok_or_else(|| ModeError(s.to_owned()))
    }
}

/// A user of a multi-user 2022 server
#[derive(Clone)]
pub struct ServerUser {
    name: String,
    key: Bytes,
    identity_hash: Bytes,
}

impl fmt::Debug for ServerUser {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // The key stays out of logs
        write!(f, "ServerUser({}, {:?})", self.name, ByteStr::new(&self.identity_hash))
    }
}

impl ServerUser {
    pub fn new<N, K>(name: N, key: K) -> ServerUser
    where
        N: Into<String>,
        K: Into<Bytes>,
    {
        let key = key.into();
        ServerUser {
            name: name.into(),
            identity_hash: Bytes::copy_from_slice(&identity_hash(&key)),
            key,
        }
    }

    /// User with a base64 uPSK, as written in configuration files
    pub fn with_encoded_key<N>(name: N, key: &str) -> Result<ServerUser, ServerConfigError>
    where
        N: Into<String>,
    {
        Ok(ServerUser::new(name, PSK_BASE64.decode(key)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The user's uPSK
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn encoded_key(&self) -> String {
        PSK_BASE64.encode(&self.key)
    }

    /// Truncated BLAKE3 hash of the key, which clients put in their identity headers
    pub fn identity_hash(&self) -> &[u8] {
        &self.identity_hash
    }
}

/// Users of a 2022 server, keyed by identity hash
///
/// Users may be added and removed while the server runs.
#[derive(Debug, Default)]
pub struct ServerUserManager {
    users: spin::RwLock<HashMap<Bytes, Arc<ServerUser>>>,
}

impl Clone for ServerUserManager {
    fn clone(&self) -> ServerUserManager {
        let users = self.users.read().clone();
        ServerUserManager {
            users: spin::RwLock::new(users),
        }
    }
}

impl ServerUserManager {
    pub fn new() -> ServerUserManager {
        ServerUserManager::default()
    }

    /// A user with the same key is replaced
    pub fn add_user(&self, user: ServerUser) {
        let hash = user.identity_hash.clone();
        self.users.write().insert(hash, Arc::new(user));
    }

    pub fn remove_user(&self, name: &str) -> Option<Arc<ServerUser>> {
        let mut users = self.users.write();
        let hash = users.values().find(|user| user.name == name)?.identity_hash.clone();
        users.remove(&hash)
    }

    pub fn get_user_by_hash(&self, user_hash: &[u8]) -> Option<Arc<ServerUser>> {
        self.users.read().get(user_hash).cloned()
    }

    pub fn user_count(&self) -> usize {
        self.users.read().len()
    }

    pub fn users(&self) -> Vec<Arc<ServerUser>> {
        self.users.read().values().cloned().collect()
    }
}

#[derive(Debug, Clone, Error)]
pub enum ServerConfigError {
    #[error("key is not base64 encoded, {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),
    #[error("{method} is expecting a {expected} bytes key, but found {actual} bytes")]
    InvalidKeyLength {
        method: CipherKind,
        expected: usize,
        actual: usize,
    },
    #[error("{0} doesn't support identity headers, multiple keys or users are not allowed")]
    UnsupportedCombination(CipherKind),
    #[error("password must not be empty")]
    EmptyPassword,
}

impl ServerConfigError {
    fn check_key_len(method: CipherKind, key: &[u8]) -> Result<(), ServerConfigError> {
        if key.len() == method.key_len() {
            return Ok(());
        }
        Err(ServerConfigError::InvalidKeyLength {
            method,
            expected: method.key_len(),
            actual: key.len(),
        })
    }
}

/// What to do with a request whose nonce was seen before
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ReplayAttackPolicy {
    /// `Reject` for AEAD and 2022 methods, `Ignore` for the rest
    #[default]
    Default,
    Ignore,
    /// Log a warning and serve the request anyway
    Detect,
    Reject,
}

impl Named for ReplayAttackPolicy {
    const NAMES: &'static [(ReplayAttackPolicy, &'static str)] = &[
        (ReplayAttackPolicy::Default, "default"),
        (ReplayAttackPolicy::Ignore, "ignore"),
        (ReplayAttackPolicy::Detect, "detect"),
        (ReplayAttackPolicy::Reject, "reject"),
    ];
}

impl ReplayAttackPolicy {
    /// The policy applied to requests of `method`
    pub fn effective(self, method: CipherKind) -> ReplayAttackPolicy {
        if self != ReplayAttackPolicy::Default {
            return self;
        }
        match method.category() {
            CipherCategory::Aead | CipherCategory::Aead2022 => ReplayAttackPolicy::Reject,
            _ => ReplayAttackPolicy::Ignore,
        }
    }
}

impl fmt::Display for ReplayAttackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Error)]
#[error("invalid replay attack policy")]
pub struct ReplayAttackPolicyError;

impl FromStr for ReplayAttackPolicy {
    type Err = ReplayAttackPolicyError;

    fn from_str(s: &str) -> Result<ReplayAttackPolicy, ReplayAttackPolicyError> {
        ReplayAttackPolicy::from_name(s).ok_or(ReplayAttackPolicyError)
    }
}

/// Keys of a server, as derived from its password
struct Keys {
    /// The password as stored, for 2022 methods only the uPSK part
    password: String,
    key: Box<[u8]>,
    /// iPSKs, outermost first
    identity_keys: Vec<Bytes>,
}

impl Keys {
    /// 2022 passwords are `iPSK:...:uPSK` in base64, the others go through `EVP_BytesToKey`
    fn derive(method: CipherKind, password: String) -> Result<Keys, ServerConfigError> {
        if !method.is_aead_2022() {
            if password.is_empty() && method.key_len() > 0 {
                return Err(ServerConfigError::EmptyPassword);
            }
            let mut key = vec![0u8; method.key_len()].into_boxed_slice();
            openssl_bytes_to_key(password.as_bytes(), &mut key);
            return Ok(Keys {
                password,
                key,
                identity_keys: Vec::new(),
            });
        }

        let (ipsks, upsk) = match password.rsplit_once(':') {
            Some((ipsks, upsk)) => (Some(ipsks), upsk),
            None => (None, password.as_str()),
        };
        if ipsks.is_some() && !method.support_eih() {
            return Err(ServerConfigError::UnsupportedCombination(method));
        }

        let decode = |encoded: &str| -> Result<Bytes, ServerConfigError> {
            let psk = PSK_BASE64.decode(encoded)?;
            ServerConfigError::check_key_len(method, &psk)?;
            Ok(Bytes::from(psk))
        };

        let key = decode(upsk)?.to_vec().into_boxed_slice();
        let identity_keys = ipsks
            .into_iter()
            .flat_map(|s| s.split(':'))
            .map(decode)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Keys {
            password: upsk.to_owned(),
            key,
            identity_keys,
        })
    }
}

/// Address, method and keys of a Shadowsocks server
#[derive(Clone, Debug)]
pub struct ServerConfig {
    addr: Address,
    password: String,
    method: CipherKind,
    key: Box<[u8]>,
    /// Connect timeout of clients
    timeout: Option<Duration>,
    /// Clients only
    identity_keys: Arc<Vec<Bytes>>,
    /// Servers only
    user_manager: Option<Arc<ServerUserManager>>,
    mode: Mode,
}

impl ServerConfig {
    /// Derive the keys of `method` from `password`
    pub fn new<A, P>(addr: A, password: P, method: CipherKind) -> Result<ServerConfig, ServerConfigError>
    where
        A: Into<Address>,
        P: Into<String>,
    {
        let keys = Keys::derive(method, password.into())?;
        Ok(ServerConfig {
            addr: addr.into(),
            password: keys.password,
            method,
            key: keys.key,
            timeout: None,
            identity_keys: Arc::new(keys.identity_keys),
            user_manager: None,
            mode: Mode::TcpAndUdp,
        })
    }

    /// 2022 configuration from raw PSKs, iPSKs first and the uPSK last
    pub fn with_psks<A>(addr: A, method: CipherKind, psks: &[&[u8]]) -> Result<ServerConfig, ServerConfigError>
    where
        A: Into<Address>,
    {
        ServerConfig::new(addr, encode_psks(psks.iter().copied()), method)
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn set_addr<A>(&mut self, addr: A)
    where
        A: Into<Address>,
    {
        self.addr = addr.into();
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn identity_keys(&self) -> &[Bytes] {
        &self.identity_keys
    }

    pub fn clone_identity_keys(&self) -> Arc<Vec<Bytes>> {
        Arc::clone(&self.identity_keys)
    }

    /// Serve the users of `user_manager`, each with their own uPSK
    pub fn set_user_manager(&mut self, user_manager: Arc<ServerUserManager>) -> Result<(), ServerConfigError> {
        if !self.method.support_eih() {
            return Err(ServerConfigError::UnsupportedCombination(self.method));
        }
        user_manager
            .users()
            .iter()
            .try_for_each(|user| ServerConfigError::check_key_len(self.method, user.key()))?;

        self.user_manager = Some(user_manager);
        Ok(())
    }

    pub fn user_manager(&self) -> Option<&ServerUserManager> {
        self.user_manager.as_deref()
    }

    pub fn clone_user_manager(&self) -> Option<Arc<ServerUserManager>> {
        self.user_manager.clone()
    }

    pub fn method(&self) -> CipherKind {
        self.method
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// SIP002 `ss://` URL of this server
    ///
    /// Legacy methods put `method:password` in base64, 2022 methods percent encode it.
    pub fn to_url(&self) -> String {
        let user_info = if self.method.is_aead_2022() {
            let keys = encode_psks(self.identity_keys.iter().map(|k| &k[..]));
            let password = match keys.is_empty() {
                true => self.password.clone(),
                false => format!("{keys}:{}", self.password),
            };
            format!("{}:{}", self.method, utf8_percent_encode(&password, NON_ALPHANUMERIC))
        } else {
            USERINFO_BASE64.encode(format!("{}:{}", self.method, self.password))
        };

        format!("ss://{user_info}@{}", self.addr)
    }

    /// Parse a SIP002 `ss://` URL, its userinfo either base64 encoded or plain
    pub fn from_url(encoded: &str) -> Result<ServerConfig, UrlParseError> {
        let url = Url::parse(encoded)?;
        if url.scheme() != "ss" {
            return Err(UrlParseError::InvalidScheme);
        }

        let (method, password) = url_user_info(&url)?;
        let addr = url_server_addr(&url)?;

        let method = method
            .parse::<CipherKind>()
            .map_err(|_| UrlParseError::UnknownMethod(method))?;
        ServerConfig::new(addr, password, method).map_err(UrlParseError::InvalidConfig)
    }
}

fn encode_psks<'a, I>(psks: I) -> String
where
    I: IntoIterator<Item = &'a [u8]>,
{
    psks.into_iter().map(|k| PSK_BASE64.encode(k)).collect::<Vec<_>>().join(":")
}

fn percent_decoded(s: &str) -> Result<String, UrlParseError> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| UrlParseError::InvalidAuthInfo)
}

/// `(method, password)` of a `ss://` URL
fn url_user_info(url: &Url) -> Result<(String, String), UrlParseError> {
    if url.username().is_empty() {
        return Err(UrlParseError::InvalidUserInfo);
    }

    if let Some(password) = url.password() {
        return Ok((percent_decoded(url.username())?, percent_decoded(password)?));
    }

    // Base64 padding arrives percent encoded from some clients
    let user_info = percent_decoded(url.username())?;
    let decoded = USERINFO_BASE64.decode(user_info.as_bytes()).map_err(|err| {
        debug!("ss:// userinfo {} isn't base64, error: {}", user_info, err);
        UrlParseError::InvalidUserInfo
    })?;
    let decoded = String::from_utf8(decoded).map_err(|_| UrlParseError::InvalidAuthInfo)?;

    match decoded.split_once(':') {
        Some((method, password)) => Ok((method.to_owned(), password.to_owned())),
        None => Err(UrlParseError::InvalidUserInfo),
    }
}

fn url_server_addr(url: &Url) -> Result<Address, UrlParseError> {
    let host = url.host_str().ok_or(UrlParseError::MissingHost)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port().unwrap_or(DEFAULT_URL_PORT);

    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(Address::SocketAddress((ip, port).into())),
        Err(..) => Address::domain_name(host, port).map_err(|_| UrlParseError::InvalidServerAddr),
    }
}

#[derive(Debug, Clone, Error)]
pub enum UrlParseError {
    #[error("{0}")]
    ParseError(#[from] url::ParseError),
    #[error("URL must have \"ss://\" scheme")]
    InvalidScheme,
    #[error("invalid user info")]
    InvalidUserInfo,
    #[error("missing host")]
    MissingHost,
    #[error("invalid authentication info")]
    InvalidAuthInfo,
    #[error("invalid server address")]
    InvalidServerAddr,
    #[error("unknown method \"{0}\"")]
    UnknownMethod(String),
    #[error("{0}")]
    InvalidConfig(ServerConfigError),
}

impl FromStr for ServerConfig {
    type Err = UrlParseError;

    fn from_str(s: &str) -> Result<ServerConfig, UrlParseError> {
        ServerConfig::from_url(s)
    }
}
