//! APNs error types
//!
//! Every failure of a send ends up as one of two domain outcomes: APNs
//! answered and rejected the notification, or the connection was lost before
//! an answer arrived. The second kind is transient and safe to resend.

use crate::http::h2;
use crate::http::tls::TlsError;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Errors returned by [`ApnsConnection::send_message`](super::ApnsConnection::send_message)
#[derive(Debug, thiserror::Error)]
pub enum ApnsError {
    /// APNs answered with a non-success status
    #[error("notification rejected with status {status}: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Rejected {
        status: u16,
        /// `reason` from the JSON error body
        reason: Option<String>,
        /// `apns-id` response header
        apns_id: Option<String>,
    },

    /// The connection went away, or could not be established
    #[error("disconnected: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Disconnected {
        /// `reason` from the GOAWAY debug data
        reason: Option<String>,
    },

    /// The payload could not be serialized
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ApnsError {
    /// Reason string reported by APNs, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            ApnsError::Rejected { reason, .. } | ApnsError::Disconnected { reason } => {
                reason.as_deref()
            }
            ApnsError::Payload(_) => None,
        }
    }

    /// True for failures where resending the same notification may succeed
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ApnsError::Disconnected { .. })
    }
}

impl From<h2::Error> for ApnsError {
    fn from(err: h2::Error) -> Self {
        match err {
            h2::Error::Response(response) => ApnsError::Rejected {
                status: response.status,
                reason: reason_of(response.json_data()),
                apns_id: response.header("apns-id").map(str::to_string),
            },
            h2::Error::Disconnected(disconnect) => ApnsError::Disconnected {
                reason: reason_of(disconnect.json_data()),
            },
            _ => ApnsError::Disconnected { reason: None },
        }
    }
}

/// JSON body APNs sends with a rejection or a GOAWAY
#[derive(Debug, Deserialize)]
pub struct ErrorBody {
    pub reason: Option<String>,
    /// Milliseconds since the epoch at which the token became invalid
    pub timestamp: Option<u64>,
}

fn reason_of(data: Option<serde_json::Value>) -> Option<String> {
    data.and_then(|value| serde_json::from_value::<ErrorBody>(value).ok())
        .and_then(|body| body.reason)
}

/// A failed connection attempt
///
/// Cloneable so that one failed attempt can be reported to every caller that
/// was waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("TLS connection failed: {0}")]
    Tls(Arc<TlsError>),

    #[error("HTTP/2 setup failed: {0}")]
    H2(Arc<h2::Error>),

    #[error("connection timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was closed while this attempt was still running
    #[error("connection attempt abandoned by disconnect")]
    Abandoned,
}

impl From<TlsError> for ConnectError {
    fn from(err: TlsError) -> Self {
        ConnectError::Tls(Arc::new(err))
    }
}

impl From<h2::Error> for ConnectError {
    fn from(err: h2::Error) -> Self {
        ConnectError::H2(Arc::new(err))
    }
}

impl From<ConnectError> for ApnsError {
    fn from(_: ConnectError) -> Self {
        ApnsError::Disconnected { reason: None }
    }
}
