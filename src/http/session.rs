//! Session abstraction
//!
//! A session is the byte stream an HTTP/2 connection runs over. Anything that
//! is an async reader and writer qualifies, which lets the connection driver
//! run unchanged over TLS, plain TCP, or an in-memory duplex pipe.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Byte transport usable by the HTTP/2 connection driver
pub trait Session: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Session for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Keepalive interval applied to long-lived provider connections
pub const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// Open a TCP connection tuned for a long-lived multiplexed session
///
/// Disables Nagle (HEADERS and small DATA frames should leave immediately)
/// and enables TCP keepalive so idle connections notice dead peers.
pub async fn connect_tcp(host: &str, port: u16) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    configure_socket(&stream)?;
    Ok(stream)
}

fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(TCP_KEEPALIVE);
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}
