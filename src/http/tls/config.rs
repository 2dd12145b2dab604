//! TLS configuration
//!
//! This module provides the client TLS configuration builder: protocol
//! versions, ALPN, SNI, peer verification and the client certificate used to
//! authenticate against the provider.

use openssl::ssl::{SslContext, SslContextBuilder, SslFiletype, SslMethod, SslVerifyMode};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Parse TLS version from string (case-insensitive)
    fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("ALPN negotiation failed: peer selected {0:?}")]
    AlpnFailed(Option<String>),
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) servername: Option<String>,
    pub(crate) verify_peer: bool,
    pub(crate) alpn: Vec<String>,
}

impl TlsConfig {
    /// Create a new client configuration builder
    pub fn client() -> Result<ClientConfigBuilder, TlsError> {
        ClientConfigBuilder::new()
    }

    /// SNI name, if set
    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    /// Whether the peer certificate chain and host name are verified
    pub fn verifies_peer(&self) -> bool {
        self.verify_peer
    }

    /// Protocols offered via ALPN, in preference order
    pub fn alpn_protocols(&self) -> &[String] {
        &self.alpn
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("servername", &self.servername)
            .field("verify_peer", &self.verify_peer)
            .field("alpn", &self.alpn)
            .finish()
    }
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    ctx_builder: SslContextBuilder,
    servername: Option<String>,
    verify_peer: bool,
    alpn: Vec<String>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    ca_file: Option<PathBuf>,
}

impl ClientConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;
        // HTTP/2 requires TLS 1.2 or later (RFC 7540 Section 9.2)
        ctx_builder.set_min_proto_version(Some(TlsVersion::Tls12.to_openssl_version()))?;
        ctx_builder.set_verify(SslVerifyMode::NONE);

        Ok(ClientConfigBuilder {
            ctx_builder,
            servername: None,
            verify_peer: false,
            alpn: Vec::new(),
            cert_file: None,
            key_file: None,
            ca_file: None,
        })
    }

    /// Set TLS version (both min and max)
    pub fn version(self, version: TlsVersion) -> Result<Self, TlsError> {
        self.version_range(version, version)
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self, TlsError> {
        if min > max {
            return Err(TlsError::InvalidConfig(format!(
                "Minimum version {} above maximum {}",
                min.as_str(),
                max.as_str()
            )));
        }
        self.ctx_builder.set_min_proto_version(Some(min.to_openssl_version()))?;
        self.ctx_builder.set_max_proto_version(Some(max.to_openssl_version()))?;
        Ok(self)
    }

    /// Set ALPN protocols
    pub fn alpn(mut self, protocols: &[&str]) -> Result<Self, TlsError> {
        // Length-prefixed wire format
        let mut alpn_bytes = Vec::new();
        for proto in protocols {
            if proto.is_empty() || proto.len() > 255 {
                return Err(TlsError::InvalidConfig(format!("Invalid ALPN protocol {:?}", proto)));
            }
            alpn_bytes.push(proto.len() as u8);
            alpn_bytes.extend_from_slice(proto.as_bytes());
        }
        self.ctx_builder.set_alpn_protos(&alpn_bytes)?;
        self.alpn = protocols.iter().map(|p| p.to_string()).collect();
        Ok(self)
    }

    /// Set SNI servername (also the name verified against the certificate)
    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        let mode = if verify {
            SslVerifyMode::PEER
        } else {
            SslVerifyMode::NONE
        };
        self.ctx_builder.set_verify(mode);
        self
    }

    /// Client certificate chain (PEM). The file may also hold the private key.
    pub fn cert_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cert_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Private key for the client certificate (PEM)
    pub fn key_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.key_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Trust anchors for peer verification instead of the system store
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.ca_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Build the TLS configuration
    ///
    /// Certificate and key files are read here, so a bad path or a key that
    /// does not match the certificate is reported before any connection.
    pub fn build(mut self) -> Result<TlsConfig, TlsError> {
        if let Some(cert_file) = &self.cert_file {
            self.ctx_builder
                .set_certificate_chain_file(cert_file)
                .map_err(|e| {
                    TlsError::Certificate(format!(
                        "Failed to load certificate {}: {}",
                        cert_file.display(),
                        e
                    ))
                })?;

            let key_file = self.key_file.as_ref().unwrap_or(cert_file);
            self.ctx_builder
                .set_private_key_file(key_file, SslFiletype::PEM)
                .map_err(|e| {
                    TlsError::Certificate(format!(
                        "Failed to load private key {}: {}",
                        key_file.display(),
                        e
                    ))
                })?;
            self.ctx_builder
                .check_private_key()
                .map_err(|e| TlsError::Certificate(format!("Private key does not match certificate: {}", e)))?;
        } else if self.key_file.is_some() {
            return Err(TlsError::InvalidConfig(
                "Private key given without a certificate".to_string(),
            ));
        }

        if self.verify_peer {
            match &self.ca_file {
                Some(ca_file) => self.ctx_builder.set_ca_file(ca_file)?,
                None => self.ctx_builder.set_default_verify_paths()?,
            }
        }

        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            servername: self.servername,
            verify_peer: self.verify_peer,
            alpn: self.alpn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert!("TLS1.0".parse::<TlsVersion>().is_err());
        assert!("invalid".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_client_config_builder() {
        let config = TlsConfig::client()
            .unwrap()
            .version(TlsVersion::Tls13)
            .unwrap()
            .alpn(&["h2"])
            .unwrap()
            .servername("api.push.apple.com")
            .verify_peer(true)
            .build()
            .unwrap();

        assert_eq!(config.servername(), Some("api.push.apple.com"));
        assert!(config.verifies_peer());
        assert_eq!(config.alpn_protocols(), &["h2".to_string()]);
    }

    #[test]
    fn test_version_range() {
        assert!(TlsConfig::client()
            .unwrap()
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
            .is_ok());

        assert!(matches!(
            TlsConfig::client()
                .unwrap()
                .version_range(TlsVersion::Tls13, TlsVersion::Tls12),
            Err(TlsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_certificate_file() {
        let result = TlsConfig::client()
            .unwrap()
            .cert_file("/nonexistent/cert.pem")
            .build();
        assert!(matches!(result, Err(TlsError::Certificate(_))));
    }

    #[test]
    fn test_garbage_certificate_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate").unwrap();

        let result = TlsConfig::client().unwrap().cert_file(file.path()).build();
        assert!(matches!(result, Err(TlsError::Certificate(_))));
    }

    #[test]
    fn test_key_without_certificate() {
        let result = TlsConfig::client().unwrap().key_file("key.pem").build();
        assert!(matches!(result, Err(TlsError::InvalidConfig(_))));
    }
}
