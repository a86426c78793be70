use crate::encoding::RelayUrl;
use crate::*;
use std::path::Path;
use std::time::Duration;

/// Engine configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The yaml could not be parsed (or emitted).
    #[error("config yaml error: {0}")]
    Yaml(String),

    /// The config file could not be read.
    #[error("config io error: {0}")]
    Io(String),

    /// A field holds a value the engine cannot run with.
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Yaml(error.to_string())
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

fn default_rpc_timeout_ms() -> u64 {
    30_000
}

fn default_handshake_timeout_ms() -> u64 {
    120_000
}

fn default_transport_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

/// Tunables for an [engine::Engine].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Relays used by `start_connect` when the caller passes none.
    #[serde(default)]
    pub default_relays: Vec<RelayUrl>,

    /// Application name advertised in connect uris.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,

    /// Application url advertised in connect uris.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,

    /// Application image advertised in connect uris.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_image: Option<String>,

    /// Comma separated permissions requested from the signer,
    /// e.g. `sign_event:1,nip44_encrypt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perms: Option<String>,

    /// Default deadline for an individual rpc call.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// How long to wait for the signer to complete a handshake.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// How many times a failed publish or subscribe is retried.
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,

    /// Initial retry backoff, doubled after each failed attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Accept inbound nip-04 formatted payloads. Off unless a signer is
    /// known to still speak it.
    #[serde(default)]
    pub accept_legacy_nip04: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_relays: Vec::new(),
            app_name: None,
            app_url: None,
            app_image: None,
            perms: None,
            rpc_timeout_ms: default_rpc_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            transport_retries: default_transport_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            accept_legacy_nip04: false,
        }
    }
}

impl std::fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_yaml_string() {
            Ok(s) => f.write_str(&s),
            Err(_) => std::fmt::Debug::fmt(self, f),
        }
    }
}

impl EngineConfig {
    /// Obtain a new config builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Parse and validate a yaml config. Missing fields take defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a yaml config file.
    pub fn load_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        trace!(path = ?path.as_ref(), "loading engine config");
        Self::from_yaml_str(&yaml)
    }

    /// Emit this config as yaml.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "rpc_timeout_ms must be non-zero".into(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "handshake_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Default rpc deadline.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Handshake deadline.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Initial transport retry backoff.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Engine configuration builder.
#[derive(Default)]
pub struct EngineConfigBuilder(EngineConfig);

impl EngineConfigBuilder {
    /// Obtain a new config builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and produce the config.
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        self.0.validate()?;
        Ok(self.0)
    }

    /// Append a default relay.
    pub fn with_relay(mut self, relay: RelayUrl) -> Self {
        self.0.default_relays.push(relay);
        self
    }

    /// Set the advertised application name.
    pub fn with_app_name<S: Into<String>>(mut self, name: S) -> Self {
        self.0.app_name = Some(name.into());
        self
    }

    /// Set the advertised application url.
    pub fn with_app_url<S: Into<String>>(mut self, url: S) -> Self {
        self.0.app_url = Some(url.into());
        self
    }

    /// Set the advertised application image.
    pub fn with_app_image<S: Into<String>>(mut self, image: S) -> Self {
        self.0.app_image = Some(image.into());
        self
    }

    /// Set the requested permissions.
    pub fn with_perms<S: Into<String>>(mut self, perms: S) -> Self {
        self.0.perms = Some(perms.into());
        self
    }

    /// Override the rpc deadline.
    pub fn with_rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.0.rpc_timeout_ms = ms;
        self
    }

    /// Override the handshake deadline.
    pub fn with_handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.0.handshake_timeout_ms = ms;
        self
    }

    /// Override the retry count and initial backoff.
    pub fn with_retries(mut self, retries: u32, backoff_ms: u64) -> Self {
        self.0.transport_retries = retries;
        self.0.retry_backoff_ms = backoff_ms;
        self
    }

    /// Accept or refuse inbound nip-04 payloads.
    pub fn with_legacy_nip04(mut self, accept: bool) -> Self {
        self.0.accept_legacy_nip04 = accept;
        self
    }
}
