//! APNs connection configuration

use super::{DEVELOPMENT_HOST, DEFAULT_PORT, PRODUCTION_HOST};
use crate::http::h2::{self, H2ClientBuilder, SettingsBuilder};
use crate::http::tls::{TlsConfig, TlsError, TlsVersion};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default time allowed for TCP connect plus TLS handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Which APNs server to talk to
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Production,
    Development,
    /// Any other provider endpoint, e.g. a local test server
    Custom { host: String, port: u16 },
}

impl Environment {
    pub fn host(&self) -> &str {
        match self {
            Environment::Production => PRODUCTION_HOST,
            Environment::Development => DEVELOPMENT_HOST,
            Environment::Custom { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Environment::Custom { port, .. } => *port,
            _ => DEFAULT_PORT,
        }
    }

    /// True for the two Apple-operated hosts
    pub fn is_apple(&self) -> bool {
        !matches!(self, Environment::Custom { .. })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("certificate verification cannot be disabled for {0}")]
    InsecureAppleHost(String),

    #[error("invalid HTTP/2 settings: {0}")]
    Settings(#[from] h2::Error),

    #[error("connect timeout must be non-zero")]
    ZeroTimeout,
}

/// Validated connection configuration
#[derive(Debug, Clone)]
pub struct ApnsConfig {
    cert_file: PathBuf,
    key_file: PathBuf,
    environment: Environment,
    verify_peer: bool,
    connect_timeout: Duration,
    max_concurrent_streams: Option<u32>,
    initial_window_size: Option<u32>,
}

impl ApnsConfig {
    /// Start a configuration from the client certificate and its key (PEM)
    pub fn builder(cert_file: impl AsRef<Path>, key_file: impl AsRef<Path>) -> ApnsConfigBuilder {
        ApnsConfigBuilder {
            cert_file: cert_file.as_ref().to_path_buf(),
            key_file: key_file.as_ref().to_path_buf(),
            environment: Environment::default(),
            verify_peer: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_concurrent_streams: None,
            initial_window_size: None,
        }
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    pub fn verifies_peer(&self) -> bool {
        self.verify_peer
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// TLS settings for one connection attempt; reads the credential files
    pub(crate) fn tls_config(&self) -> Result<TlsConfig, TlsError> {
        TlsConfig::client()?
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)?
            .alpn(&["h2"])?
            .servername(self.environment.host())
            .verify_peer(self.verify_peer)
            .cert_file(&self.cert_file)
            .key_file(&self.key_file)
            .build()
    }

    pub(crate) fn h2_builder(&self) -> H2ClientBuilder {
        let mut builder = H2ClientBuilder::new();
        if let Some(max) = self.max_concurrent_streams {
            builder = builder.max_concurrent_streams(max);
        }
        if let Some(size) = self.initial_window_size {
            builder = builder.initial_window_size(size);
        }
        builder
    }
}

/// Builder for [`ApnsConfig`]
#[derive(Debug, Clone)]
pub struct ApnsConfigBuilder {
    cert_file: PathBuf,
    key_file: PathBuf,
    environment: Environment,
    verify_peer: Option<bool>,
    connect_timeout: Duration,
    max_concurrent_streams: Option<u32>,
    initial_window_size: Option<u32>,
}

impl ApnsConfigBuilder {
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Override peer verification. Defaults to on for Apple hosts and off
    /// for custom hosts.
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = Some(verify);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// SETTINGS_MAX_CONCURRENT_STREAMS advertised to the server
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = Some(max);
        self
    }

    /// SETTINGS_INITIAL_WINDOW_SIZE for response bodies
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = Some(size);
        self
    }

    pub fn build(self) -> Result<ApnsConfig, ConfigError> {
        let verify_peer = self.verify_peer.unwrap_or(self.environment.is_apple());
        if !verify_peer && self.environment.is_apple() {
            return Err(ConfigError::InsecureAppleHost(self.environment.host().to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        let mut settings = SettingsBuilder::new().enable_push(false);
        if let Some(max) = self.max_concurrent_streams {
            settings = settings.max_concurrent_streams(max);
        }
        if let Some(size) = self.initial_window_size {
            settings = settings.initial_window_size(size);
        }
        settings.build()?;

        Ok(ApnsConfig {
            cert_file: self.cert_file,
            key_file: self.key_file,
            environment: self.environment,
            verify_peer,
            connect_timeout: self.connect_timeout,
            max_concurrent_streams: self.max_concurrent_streams,
            initial_window_size: self.initial_window_size,
        })
    }
}
