//! Configuration management for the `sigrpc` binary.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/sigrpc/config.toml`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{Authenticator, CodecKind, Identity, PeerIdentity, TrustPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ClientConfig;
use crate::server::{ServerConfig, DEFAULT_MAX_CONCURRENT_REQUESTS};
use crate::transport::http::DEFAULT_MAX_BODY_SIZE;
use crate::transport::ChannelOptions;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_concurrent_requests must be between 1 and 10000, got {0}")]
    InvalidMaxConcurrentRequests(usize),

    #[error("max_body_size must be greater than 0, got {0}")]
    InvalidMaxBodySize(usize),

    #[error("timeout_secs must be between 1 and 3600 seconds, got {0}")]
    InvalidTimeout(u64),

    #[error("listen endpoint must not be empty")]
    EmptyListen,

    #[error("trusted key is not a valid Ed25519 public key: {0}")]
    InvalidTrustedKey(String),

    #[error("trust_policy {policy} needs {expected} trusted key(s), got {got}")]
    TrustedKeyCount {
        policy: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and dispatch settings.
    pub server: ServerSection,

    /// Outgoing call settings.
    pub client: ClientSection,

    /// Identity and trust settings.
    pub security: SecuritySection,

    /// Logging settings.
    pub logging: LoggingSection,
}

/// Listener and dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    /// Stream endpoint, `host:port` or `unix:/path`.
    pub listen: String,

    /// Optional HTTP listen address. The HTTP carrier is off when unset.
    pub http_listen: Option<String>,

    /// Wire codec (json or msgpack).
    pub codec: CodecKind,

    /// Handlers allowed to run at once on one connection.
    pub max_concurrent_requests: usize,

    /// Largest accepted HTTP request body in bytes.
    pub max_body_size: usize,
}

/// Outgoing call settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSection {
    /// Where to connect: `host:port`, `unix:/path` or an `http://` URL.
    pub endpoint: String,

    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

/// How peer keys are trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustMode {
    /// Exactly one key from `trusted_keys`.
    Pinned,
    /// Any key from `trusted_keys`.
    AllowList,
    /// The first key that signs correctly.
    #[default]
    FirstSeen,
}

/// Identity and trust settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecuritySection {
    /// File holding this node's hex-encoded secret key.
    pub identity_file: PathBuf,

    /// Trust mode for peers.
    pub trust_policy: TrustMode,

    /// Hex-encoded peer public keys.
    pub trusted_keys: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingSection {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7878".to_string(),
            http_listen: None,
            codec: CodecKind::Json,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:7878".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            identity_file: default_identity_path(),
            trust_policy: TrustMode::FirstSeen,
            trusted_keys: Vec::new(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sigrpc")
        .join("config.toml")
}

/// Returns the default identity key path.
fn default_identity_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sigrpc")
        .join("identity.key")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - SIGRPC_LISTEN: Override the stream listen endpoint
    /// - SIGRPC_ENDPOINT: Override the client endpoint
    /// - SIGRPC_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("SIGRPC_LISTEN") {
            if !listen.is_empty() {
                tracing::info!("Overriding listen from environment: {}", listen);
                self.server.listen = listen;
            }
        }

        if let Ok(endpoint) = std::env::var("SIGRPC_ENDPOINT") {
            if !endpoint.is_empty() {
                tracing::info!("Overriding endpoint from environment: {}", endpoint);
                self.client.endpoint = endpoint;
            }
        }

        if let Ok(level) = std::env::var("SIGRPC_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.server.max_concurrent_requests;
        if !(1..=10_000).contains(&max) {
            return Err(ConfigError::InvalidMaxConcurrentRequests(max));
        }

        if self.server.max_body_size == 0 {
            return Err(ConfigError::InvalidMaxBodySize(self.server.max_body_size));
        }

        if self.server.listen.trim().is_empty() {
            return Err(ConfigError::EmptyListen);
        }

        if !(1..=3600).contains(&self.client.timeout_secs) {
            return Err(ConfigError::InvalidTimeout(self.client.timeout_secs));
        }

        self.trusted_peers()?;

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Parse `trusted_keys` and check the count fits the trust mode.
    pub fn trusted_peers(&self) -> Result<Vec<PeerIdentity>, ConfigError> {
        let peers = self
            .security
            .trusted_keys
            .iter()
            .map(|key| {
                PeerIdentity::from_hex(key.trim())
                    .map_err(|_| ConfigError::InvalidTrustedKey(key.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        match self.security.trust_policy {
            TrustMode::Pinned if peers.len() != 1 => Err(ConfigError::TrustedKeyCount {
                policy: "pinned",
                expected: "exactly 1",
                got: peers.len(),
            }),
            TrustMode::AllowList if peers.is_empty() => Err(ConfigError::TrustedKeyCount {
                policy: "allow_list",
                expected: "at least 1",
                got: 0,
            }),
            _ => Ok(peers),
        }
    }

    /// Build a fresh trust policy from the security section.
    ///
    /// Each call returns independent state, so a first-seen policy starts
    /// empty every time.
    pub fn trust_policy(&self) -> Result<TrustPolicy, ConfigError> {
        Ok(self.trust_policy_factory()?())
    }

    /// Validate the security section once and return a constructor for
    /// fresh trust policies, one per connection.
    pub fn trust_policy_factory(
        &self,
    ) -> Result<impl Fn() -> TrustPolicy + Send + Sync + 'static, ConfigError> {
        let peers = self.trusted_peers()?;
        let mode = self.security.trust_policy;
        Ok(move || match (mode, peers.first()) {
            (TrustMode::Pinned, Some(peer)) => TrustPolicy::pinned(*peer),
            (TrustMode::Pinned, None) | (TrustMode::AllowList, _) => {
                TrustPolicy::allow_list(peers.iter().copied())
            }
            (TrustMode::FirstSeen, _) => TrustPolicy::first_seen(),
        })
    }

    /// Build an authenticator for `identity` using the configured policy.
    pub fn authenticator(&self, identity: Identity) -> Result<Authenticator, ConfigError> {
        Ok(Authenticator::new(identity, self.trust_policy()?))
    }

    /// Server settings derived from this configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            max_concurrent_requests: self.server.max_concurrent_requests,
            channel: ChannelOptions::default(),
        }
    }

    /// Client settings derived from this configuration.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            default_timeout: Duration::from_secs(self.client.timeout_secs),
        }
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Read a hex-encoded secret key from `path`.
pub fn load_identity<P: AsRef<Path>>(path: P) -> Result<Identity> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read identity file: {}", path.display()))?;
    Identity::from_hex(contents.trim())
        .with_context(|| format!("Invalid identity file: {}", path.display()))
}

/// Write `identity`'s secret key to `path` as hex.
///
/// The file is created readable by the owner only.
pub fn save_identity<P: AsRef<Path>>(path: P, identity: &Identity) -> Result<()> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create identity directory: {}", parent.display())
        })?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to write identity file: {}", path.display()))?;

    // `mode` only applies on creation, so tighten a pre-existing file as well
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to restrict identity file: {}", path.display()))?;
    }

    writeln!(file, "{}", identity.secret_key_hex())
        .with_context(|| format!("Failed to write identity file: {}", path.display()))?;

    Ok(())
}

/// Load the identity at `path`, generating and saving one if it is missing.
pub fn load_or_create_identity<P: AsRef<Path>>(path: P) -> Result<Identity> {
    let path = path.as_ref();
    if path.exists() {
        return load_identity(path);
    }

    let identity = Identity::generate();
    save_identity(path, &identity)?;
    tracing::info!(
        path = %path.display(),
        fingerprint = %identity.fingerprint(),
        "generated new identity"
    );
    Ok(identity)
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn peer_hex() -> String {
        Identity::generate().to_peer_identity().public_key_hex()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.listen, "127.0.0.1:7878");
        assert!(config.server.http_listen.is_none());
        assert_eq!(config.server.codec, CodecKind::Json);
        assert_eq!(config.server.max_concurrent_requests, 64);
        assert_eq!(config.server.max_body_size, 4096);
        assert_eq!(config.client.timeout_secs, 30);
        assert_eq!(config.security.trust_policy, TrustMode::FirstSeen);
        assert!(config.security.trusted_keys.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_default_identity_path() {
        let config = SecuritySection::default();
        assert!(config.identity_file.to_string_lossy().contains("sigrpc"));
        assert!(config.identity_file.ends_with("identity.key"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
codec = "msgpack"

[logging]
level = "debug"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.codec, CodecKind::Msgpack);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server.listen, "127.0.0.1:7878");
    }

    #[test]
    fn test_from_toml_full() {
        let key = peer_hex();
        let toml = format!(
            r#"
[server]
listen = "unix:/tmp/sigrpc.sock"
http_listen = "0.0.0.0:8080"
codec = "msgpack"
max_concurrent_requests = 8
max_body_size = 65536

[client]
endpoint = "http://127.0.0.1:8080/rpc"
timeout_secs = 5

[security]
identity_file = "/etc/sigrpc/identity.key"
trust_policy = "pinned"
trusted_keys = ["{key}"]

[logging]
level = "trace"
"#
        );
        let config = Config::from_toml(&toml).unwrap();

        assert_eq!(config.server.listen, "unix:/tmp/sigrpc.sock");
        assert_eq!(config.server.http_listen.as_deref(), Some("0.0.0.0:8080"));
        assert_eq!(config.server.max_concurrent_requests, 8);
        assert_eq!(config.server.max_body_size, 65536);
        assert_eq!(config.client.endpoint, "http://127.0.0.1:8080/rpc");
        assert_eq!(config.client.timeout_secs, 5);
        assert_eq!(
            config.security.identity_file,
            PathBuf::from("/etc/sigrpc/identity.key")
        );
        assert_eq!(config.security.trust_policy, TrustMode::Pinned);
        assert_eq!(config.security.trusted_keys, vec![key]);
        assert_eq!(config.logging.level, "trace");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[server
listen = "x"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_unknown_codec() {
        let toml = r#"
[server]
codec = "xml"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let mut original = Config::default();
        original.server.http_listen = Some("127.0.0.1:9000".to_string());
        original.security.trust_policy = TrustMode::AllowList;
        original.security.trusted_keys = vec![peer_hex(), peer_hex()];

        let toml = original.to_toml().unwrap();
        assert!(toml.contains("[server]"));
        assert!(toml.contains("[security]"));
        assert_eq!(Config::from_toml(&toml).unwrap(), original);
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load(temp_dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("config.toml");

        let mut config = Config::default();
        config.client.timeout_secs = 12;
        config.save(&path).unwrap();

        assert!(path.exists());
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "not = [valid").unwrap();

        let err = format!("{:#}", Config::load(&path).unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("sigrpc/config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_listen() {
        std::env::set_var("SIGRPC_LISTEN", "unix:/run/sigrpc.sock");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.server.listen, "unix:/run/sigrpc.sock");

        std::env::remove_var("SIGRPC_LISTEN");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("SIGRPC_ENDPOINT", "");
        std::env::set_var("SIGRPC_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());

        std::env::remove_var("SIGRPC_ENDPOINT");
        std::env::remove_var("SIGRPC_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("SIGRPC_LISTEN");
        std::env::set_var("SIGRPC_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.logging.level, "debug");

        std::env::remove_var("SIGRPC_LOG_LEVEL");
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_bounds() {
        let mut config = Config::default();
        config.server.max_concurrent_requests = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxConcurrentRequests(0))
        );

        let mut config = Config::default();
        config.server.max_body_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxBodySize(0)));

        let mut config = Config::default();
        config.client.timeout_secs = 3601;
        assert_eq!(config.validate(), Err(ConfigError::InvalidTimeout(3601)));

        let mut config = Config::default();
        config.server.listen = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyListen));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.logging.level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_validate_trusted_keys() {
        let mut config = Config::default();
        config.security.trusted_keys = vec!["zz".to_string()];
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidTrustedKey("zz".to_string()))
        );

        let mut config = Config::default();
        config.security.trust_policy = TrustMode::Pinned;
        config.security.trusted_keys = vec![peer_hex(), peer_hex()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TrustedKeyCount { got: 2, .. })
        ));

        config.security.trust_policy = TrustMode::AllowList;
        assert!(config.validate().is_ok());

        config.security.trusted_keys.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TrustedKeyCount { got: 0, .. })
        ));
    }

    #[test]
    fn test_trust_policy_kinds() {
        let peer = Identity::generate().to_peer_identity();
        let mut config = Config::default();
        config.security.trust_policy = TrustMode::Pinned;
        config.security.trusted_keys = vec![peer.public_key_hex()];

        assert!(matches!(
            config.trust_policy().unwrap(),
            TrustPolicy::Pinned(p) if p == peer
        ));

        config.security.trust_policy = TrustMode::FirstSeen;
        let policy = config.trust_policy().unwrap();
        assert!(matches!(policy, TrustPolicy::FirstSeen(_)));
        assert!(policy.recorded().is_none());

        let auth = config.authenticator(Identity::generate()).unwrap();
        assert_eq!(auth.policy_name(), "first_seen");
    }

    #[test]
    fn test_derived_settings() {
        let mut config = Config::default();
        config.server.max_concurrent_requests = 3;
        config.client.timeout_secs = 7;

        assert_eq!(config.server_config().max_concurrent_requests, 3);
        assert_eq!(
            config.client_config().default_timeout,
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_identity_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys").join("identity.key");

        let created = load_or_create_identity(&path).unwrap();
        assert!(path.exists());

        let loaded = load_or_create_identity(&path).unwrap();
        assert_eq!(created.public_key_bytes(), loaded.public_key_bytes());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_save_identity_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("identity.key");
        fs::write(&path, "stale key material that is longer than a hex secret key\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let identity = Identity::generate();
        save_identity(&path, &identity).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let loaded = load_identity(&path).unwrap();
        assert_eq!(loaded.public_key_bytes(), identity.public_key_bytes());
    }

    #[test]
    fn test_load_identity_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("identity.key");
        fs::write(&path, "not hex").unwrap();
        assert!(load_identity(&path).is_err());
    }
}
