use std::fmt;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

use crate::error::Error;

/// Value used when no cap is configured on the security strength factor.
pub const DEFAULT_MAX_SSF: u32 = 65535;
/// Largest segment the codec produces or accepts when nothing else is configured.
pub const DEFAULT_MAX_BUFFER_SIZE: u32 = 65535;

/// Secret material (passwords, interaction answers).
///
/// The bytes are wiped when the value is dropped and never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    pub fn expose_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl From<Vec<u8>> for Secret {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(&self.0))
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        String::deserialize(deserializer).map(Secret::from)
    }
}

/// Negotiation parameters consumed when a session is created.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionConfig {
    /// Authentication identity.
    #[serde(default)]
    pub username: Option<String>,
    /// Identity to act as, when it differs from `username` (proxy authorization).
    #[serde(default)]
    pub authorization_identity: Option<String>,
    #[serde(default)]
    pub credential: Option<Secret>,

    /// Identity established by the transport below us (e.g. a TLS client certificate).
    #[serde(default)]
    pub external_identity: Option<String>,
    #[serde(default)]
    pub external_ssf: u32,

    #[serde(default)]
    pub min_ssf: u32,
    #[serde(default = "default_max_ssf")]
    pub max_ssf: u32,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: u32,

    /// Mechanisms to advertise or try, in preference order. Empty means all.
    #[serde(default)]
    pub mechanisms: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            username: None,
            authorization_identity: None,
            credential: None,
            external_identity: None,
            external_ssf: 0,
            min_ssf: 0,
            max_ssf: DEFAULT_MAX_SSF,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            mechanisms: vec![],
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_authorization_identity(mut self, authzid: impl Into<String>) -> Self {
        self.authorization_identity = Some(authzid.into());
        self
    }

    pub fn with_credential(mut self, credential: impl Into<Secret>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_external(mut self, identity: impl Into<String>, ssf: u32) -> Self {
        self.external_identity = Some(identity.into());
        self.external_ssf = ssf;
        self
    }

    pub fn with_ssf_range(mut self, min_ssf: u32, max_ssf: u32) -> Self {
        self.min_ssf = min_ssf;
        self.max_ssf = max_ssf;
        self
    }

    pub fn with_max_buffer_size(mut self, size: u32) -> Self {
        self.max_buffer_size = size;
        self
    }

    pub fn with_mechanisms<I, S>(mut self, mechanisms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mechanisms = mechanisms.into_iter().map(Into::into).collect();
        self
    }

    /// Apply defaults to unset limits and reject contradictory bounds.
    pub fn normalize(mut self) -> Result<Self, Error> {
        if self.max_ssf == 0 {
            self.max_ssf = DEFAULT_MAX_SSF;
        }
        if self.max_buffer_size == 0 {
            self.max_buffer_size = DEFAULT_MAX_BUFFER_SIZE;
        }
        if self.min_ssf > self.max_ssf {
            return Err(Error::Config(format!(
                "min_ssf ({}) is greater than max_ssf ({})",
                self.min_ssf, self.max_ssf
            )));
        }
        if self.username.as_deref() == Some("") {
            self.username = None;
        }
        if self.authorization_identity.as_deref() == Some("") {
            self.authorization_identity = None;
        }
        if self.credential.as_ref().map_or(false, Secret::is_empty) {
            self.credential = None;
        }
        Ok(self)
    }

    /// Identity the session asks to be authorized as.
    pub fn authorization_id(&self) -> Option<&str> {
        self.authorization_identity
            .as_deref()
            .or(self.username.as_deref())
    }

    /// True when authorization is requested for someone else than the authenticated user.
    pub fn wants_proxy(&self) -> bool {
        match (&self.authorization_identity, &self.username) {
            (Some(authz), Some(user)) => authz != user,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Names the service being authenticated to.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Registered service name, e.g. `imap` or `ldap`.
    pub service: String,
    pub hostname: String,
    /// Defaults to the hostname.
    #[serde(default)]
    pub realm: Option<String>,
}

impl ServiceConfig {
    pub fn new(service: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            hostname: hostname.into(),
            realm: None,
        }
    }

    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    pub fn realm(&self) -> &str {
        self.realm.as_deref().unwrap_or(&self.hostname)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

pub fn read_config(config_file: PathBuf) -> Result<Config> {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .open(config_file.as_path())
        .with_context(|| format!("open {}", config_file.display()))?;

    let mut config = String::new();
    file.read_to_string(&mut config)?;

    let mut parsed: Config = toml::from_str(&config)?;
    parsed.session = parsed.session.normalize()?;
    Ok(parsed)
}

fn default_max_ssf() -> u32 {
    DEFAULT_MAX_SSF
}

fn default_max_buffer_size() -> u32 {
    DEFAULT_MAX_BUFFER_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_unset_limits() {
        let conf = SessionConfig::new()
            .with_ssf_range(0, 0)
            .with_max_buffer_size(0)
            .normalize()
            .unwrap();
        assert_eq!(conf.max_ssf, 65535);
        assert_eq!(conf.max_buffer_size, 65535);
    }

    #[test]
    fn test_min_above_max_is_rejected() {
        let res = SessionConfig::new().with_ssf_range(128, 56).normalize();
        assert!(matches!(res, Err(Error::Config(_))));
    }

    #[test]
    fn test_proxy_detection() {
        let conf = SessionConfig::new().with_username("alice");
        assert!(!conf.wants_proxy());
        assert_eq!(conf.authorization_id(), Some("alice"));

        let conf = conf.with_authorization_identity("bob");
        assert!(conf.wants_proxy());
        assert_eq!(conf.authorization_id(), Some("bob"));
    }

    #[test]
    fn test_secret_is_redacted() {
        let conf = SessionConfig::new().with_credential("hunter2");
        let dbg = format!("{:?}", conf);
        assert!(!dbg.contains("hunter2"));
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            [service]
            service = "imap"
            hostname = "mail.example.tld"

            [session]
            username = "alice"
            credential = "hunter2"
            max_buffer_size = 4096
            mechanisms = ["PLAIN", "LOGIN"]
        "#;
        let conf: Config = toml::from_str(raw).unwrap();
        assert_eq!(conf.service.realm(), "mail.example.tld");
        assert_eq!(conf.session.username.as_deref(), Some("alice"));
        assert_eq!(
            conf.session.credential.as_ref().map(Secret::expose),
            Some(&b"hunter2"[..])
        );
        assert_eq!(conf.session.max_ssf, 65535);
        assert_eq!(conf.session.max_buffer_size, 4096);
        assert_eq!(conf.session.mechanisms, vec!["PLAIN", "LOGIN"]);
    }
}
