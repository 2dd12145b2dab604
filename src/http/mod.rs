//! HTTP/2 transport for apns-h2
//!
//! This module provides the transport layers below the APNs client:
//!
//! - `session` defines what a byte transport must offer (any async stream)
//! - `tls` establishes the OpenSSL-backed TLS session with ALPN `h2`
//! - `h2` implements framing, stream multiplexing and flow control
//!
//! # Architecture
//!
//! The HTTP/2 code never touches a socket type directly. It is generic over
//! [`Session`], so the same connection driver runs over a TLS stream in
//! production and over an in-memory pipe in tests.
//!
//! # Examples
//!
//! ```no_run
//! use apns_h2::http::h2::H2ClientBuilder;
//! use apns_h2::http::tls::{self, TlsConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let tls_config = TlsConfig::client()?
//!     .alpn(&["h2"])?
//!     .servername("api.push.apple.com")
//!     .build()?;
//!
//! let stream = tls::connect(&tls_config, "api.push.apple.com", 443).await?;
//! let client = H2ClientBuilder::new().build(stream)?;
//!
//! let response = client
//!     .send_request(vec![(":method".into(), "GET".into())], None)
//!     .await?;
//! println!("Status: {}", response.status());
//! # Ok(())
//! # }
//! ```

pub mod h2;
pub mod session;
pub mod tls;

pub use session::Session;
