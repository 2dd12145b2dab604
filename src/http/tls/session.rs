//! TLS sessions
//!
//! Client handshake over any async byte stream, producing a
//! `tokio_openssl::SslStream` that the HTTP/2 driver uses as its session.

use super::config::{TlsConfig, TlsError};
use crate::http::session::connect_tcp;
use openssl::ssl::{NameType, Ssl, SslRef};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::debug;

/// TLS over TCP, as used for provider connections
pub type TlsStream = SslStream<TcpStream>;

/// What the handshake negotiated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    /// Negotiated TLS version (e.g., "TLSv1.3")
    pub version: String,
    /// Negotiated cipher suite
    pub cipher: Option<String>,
    /// SNI servername sent
    pub servername: Option<String>,
    /// Negotiated ALPN protocol
    pub alpn: Option<String>,
}

impl TlsInfo {
    /// Read negotiated parameters off a completed handshake
    pub fn from_ssl(ssl: &SslRef) -> Self {
        TlsInfo {
            version: ssl.version_str().to_string(),
            cipher: ssl.current_cipher().map(|c| c.name().to_string()),
            servername: ssl.servername(NameType::HOST_NAME).map(|s| s.to_string()),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        }
    }
}

/// Perform the client handshake over an established stream
///
/// When the configuration offers ALPN protocols, the peer must select one of
/// them; otherwise the handshake is reported as [`TlsError::AlpnFailed`].
pub async fn handshake<S>(config: &TlsConfig, stream: S) -> Result<SslStream<S>, TlsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ssl = Ssl::new(&config.ctx)?;

    if let Some(servername) = &config.servername {
        ssl.set_hostname(servername)?;
        if config.verify_peer {
            ssl.param_mut().set_host(servername)?;
        }
    }

    let mut tls = SslStream::new(ssl, stream)?;
    Pin::new(&mut tls)
        .connect()
        .await
        .map_err(|e| TlsError::HandshakeFailed(e.to_string()))?;

    let info = TlsInfo::from_ssl(tls.ssl());
    debug!(
        version = %info.version,
        cipher = ?info.cipher,
        alpn = ?info.alpn,
        servername = ?info.servername,
        "TLS handshake complete"
    );

    if !config.alpn.is_empty() {
        match &info.alpn {
            Some(selected) if config.alpn.iter().any(|p| p == selected) => {}
            other => return Err(TlsError::AlpnFailed(other.clone())),
        }
    }

    Ok(tls)
}

/// Open a TCP connection to `host:port` and perform the client handshake
pub async fn connect(config: &TlsConfig, host: &str, port: u16) -> Result<TlsStream, TlsError> {
    let tcp = connect_tcp(host, port).await?;
    handshake(config, tcp).await
}
