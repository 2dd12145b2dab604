//! TLS support for provider connections
//!
//! This module implements the client side of TLS with OpenSSL: a
//! configuration builder and an async handshake that yields a stream the
//! HTTP/2 driver can run over.
//!
//! # Architecture
//!
//! 1. `TlsConfig` defines TLS settings (versions, ALPN, certificates)
//! 2. `handshake` / `connect` produce a `tokio_openssl::SslStream`
//! 3. The stream is a [`Session`](crate::http::Session), so the HTTP/2 code
//!    never sees whether it runs over TLS
//!
//! # Examples
//!
//! ```no_run
//! use apns_h2::http::tls::{self, TlsConfig, TlsVersion};
//!
//! # async fn run() -> Result<(), tls::TlsError> {
//! let config = TlsConfig::client()?
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)?
//!     .alpn(&["h2"])?
//!     .servername("api.push.apple.com")
//!     .verify_peer(true)
//!     .cert_file("apns-cert.pem")
//!     .build()?;
//!
//! let stream = tls::connect(&config, "api.push.apple.com", 443).await?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod session;

pub use config::{ClientConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use session::{connect, handshake, TlsInfo, TlsStream};

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
