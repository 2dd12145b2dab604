//! APNs provider connection
//!
//! [`ApnsConnection`] keeps at most one HTTP/2 connection to APNs alive and
//! turns notifications into requests on it. Connecting is lazy and coalesced:
//! callers that find the connection down while an attempt is already running
//! wait for that attempt instead of starting their own.

use super::config::ApnsConfig;
use super::error::{ApnsError, ConnectError};
use super::payload::Payload;
use crate::http::h2::H2Client;
use crate::http::tls;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Opens transports for an [`ApnsConnection`]
///
/// The production implementation is [`TlsConnector`]; anything that can
/// produce a running [`H2Client`] works, which is how tests connect to an
/// in-process server.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<H2Client, ConnectError>>;
}

/// TLS connection to the configured APNs environment
#[derive(Debug, Clone)]
pub struct TlsConnector {
    config: Arc<ApnsConfig>,
}

impl TlsConnector {
    pub fn new(config: ApnsConfig) -> Self {
        TlsConnector {
            config: Arc::new(config),
        }
    }
}

impl Connector for TlsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<H2Client, ConnectError>> {
        let config = self.config.clone();
        async move {
            let tls_config = config.tls_config()?;
            let environment = config.environment();
            let timeout = config.connect_timeout();

            let stream = tokio::time::timeout(
                timeout,
                tls::connect(&tls_config, environment.host(), environment.port()),
            )
            .await
            .map_err(|_| ConnectError::Timeout(timeout))??;

            Ok(config.h2_builder().build(stream)?)
        }
        .boxed()
    }
}

/// `apns-priority` header value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationPriority {
    /// Deliver now
    #[default]
    Immediate = 10,
    /// Deliver at a time that conserves power on the device
    Delayed = 5,
}

impl NotificationPriority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// One notification for one device
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub payload: Payload,
    /// Hex device token
    pub token: String,
    pub priority: NotificationPriority,
    /// `apns-topic`, usually the app's bundle ID
    pub topic: Option<String>,
}

impl Notification {
    pub fn new(payload: impl Into<Payload>, token: impl Into<String>) -> Self {
        Notification {
            payload: payload.into(),
            token: token.into(),
            priority: NotificationPriority::default(),
            topic: None,
        }
    }

    pub fn priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }
}

/// Something that can deliver a notification
///
/// Resolves to the `apns-id` the server assigned, if it sent one.
pub trait Notifier: Send + Sync {
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<Option<String>, ApnsError>>;
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<H2Client, ConnectError>>>;

#[derive(Default)]
struct Lifecycle {
    client: Option<H2Client>,
    /// The connect in flight; it stays here until it finishes, even when
    /// a disconnect has abandoned it
    pending: Option<Attempt>,
    attempts: u64,
    /// Bumped by every disconnect
    generation: u64,
}

struct Attempt {
    id: u64,
    /// Generation the attempt was started in
    generation: u64,
    future: ConnectAttempt,
}

/// A lazily connected, self-reconnecting APNs connection
pub struct ApnsConnection {
    authority: String,
    connector: Arc<dyn Connector>,
    state: Mutex<Lifecycle>,
}

impl ApnsConnection {
    /// Connection to the configured environment; nothing is opened yet
    pub fn new(config: ApnsConfig) -> Self {
        let authority = config.environment().host().to_string();
        ApnsConnection::with_connector(authority, TlsConnector::new(config))
    }

    /// Connection that opens transports through `connector`
    ///
    /// `authority` is sent as the `:authority` of every request.
    pub fn with_connector(authority: impl Into<String>, connector: impl Connector) -> Self {
        ApnsConnection {
            authority: authority.into(),
            connector: Arc::new(connector),
            state: Mutex::new(Lifecycle::default()),
        }
    }

    /// True while a live connection accepts requests
    pub fn connected(&self) -> bool {
        self.state
            .lock()
            .client
            .as_ref()
            .map_or(false, |client| client.is_open())
    }

    /// Make sure a connection is up, connecting if needed
    ///
    /// At most one attempt runs at a time. Callers arriving while one is in
    /// flight share its outcome, success or failure, and the attempt is
    /// forgotten once it finishes so the next call after a failure retries.
    pub async fn ensure_connected(&self) -> Result<H2Client, ConnectError> {
        loop {
            let (attempt_id, started_in, joined_in, future) = {
                let mut state = self.state.lock();
                if let Some(client) = state.client.as_ref().filter(|client| client.is_open()) {
                    return Ok(client.clone());
                }
                let generation = state.generation;
                match &state.pending {
                    Some(attempt) => {
                        debug!(attempt = attempt.id, "joining connect in progress");
                        (attempt.id, attempt.generation, generation, attempt.future.clone())
                    }
                    None => {
                        state.attempts += 1;
                        let attempt_id = state.attempts;
                        info!(authority = %self.authority, attempt = attempt_id, "connecting to APNs");
                        let future = self.connector.connect().shared();
                        state.pending = Some(Attempt {
                            id: attempt_id,
                            generation,
                            future: future.clone(),
                        });
                        (attempt_id, generation, generation, future)
                    }
                }
            };

            let result = future.await;

            let mut state = self.state.lock();
            let finished_here = matches!(&state.pending, Some(attempt) if attempt.id == attempt_id);
            if finished_here {
                state.pending = None;
            }

            if started_in != state.generation {
                // A disconnect abandoned this attempt while it was running
                if let Ok(client) = &result {
                    client.shutdown();
                }
                if finished_here {
                    debug!(attempt = attempt_id, "connect finished after disconnect, closing it");
                }
                if joined_in == state.generation {
                    // Arrived after the last disconnect: start a fresh attempt
                    continue;
                }
                return Err(ConnectError::Abandoned);
            }

            if finished_here {
                match &result {
                    Ok(client) => {
                        info!(authority = %self.authority, "connected to APNs");
                        state.client = Some(client.clone());
                    }
                    Err(err) => warn!(authority = %self.authority, error = %err, "APNs connect failed"),
                }
            }
            return result;
        }
    }

    /// Close the connection with GOAWAY(NO_ERROR)
    ///
    /// Requests still in flight fail as disconnected, and so do callers
    /// waiting on a connect that is still running. Calling this while
    /// already disconnected does nothing.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        if let Some(client) = state.client.take() {
            info!(authority = %self.authority, "disconnecting from APNs");
            client.shutdown();
        }
    }

    /// Send one notification
    ///
    /// Connects first if needed. Returns the `apns-id` of the accepted
    /// notification, if the server sent one.
    pub async fn send_message(
        &self,
        payload: impl Into<Payload>,
        token: &str,
        priority: NotificationPriority,
        topic: Option<&str>,
    ) -> Result<Option<String>, ApnsError> {
        let body = payload.into().to_json()?;
        let headers = self.request_headers(token, body.len(), priority, topic);

        let client = self.ensure_connected().await?;
        let response = client.send_request(headers, Some(Bytes::from(body))).await;
        match response {
            Ok(response) => Ok(response.header("apns-id").map(str::to_string)),
            Err(err) => {
                let err = ApnsError::from(err);
                debug!(error = %err, "notification failed");
                Err(err)
            }
        }
    }

    fn request_headers(
        &self,
        token: &str,
        content_length: usize,
        priority: NotificationPriority,
        topic: Option<&str>,
    ) -> Vec<(String, String)> {
        let mut headers = vec![
            (":method".to_string(), "POST".to_string()),
            (":authority".to_string(), self.authority.clone()),
            (":scheme".to_string(), "https".to_string()),
            (":path".to_string(), format!("/3/device/{}", token)),
            ("content-length".to_string(), content_length.to_string()),
            ("apns-priority".to_string(), priority.as_u8().to_string()),
        ];
        if let Some(topic) = topic {
            headers.push(("apns-topic".to_string(), topic.to_string()));
        }
        headers
    }
}

impl Notifier for ApnsConnection {
    fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<Option<String>, ApnsError>> {
        self.send_message(
            notification.payload.clone(),
            &notification.token,
            notification.priority,
            notification.topic.as_deref(),
        )
        .boxed()
    }
}

impl fmt::Debug for ApnsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApnsConnection")
            .field("authority", &self.authority)
            .field("connected", &self.connected())
            .finish()
    }
}

impl Drop for ApnsConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::H2ClientBuilder;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingConnector {
        attempts: Arc<AtomicUsize>,
    }

    impl Connector for FailingConnector {
        fn connect(&self) -> BoxFuture<'static, Result<H2Client, ConnectError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::task::yield_now().await;
                Err(ConnectError::Timeout(std::time::Duration::from_secs(1)))
            }
            .boxed()
        }
    }

    fn failing() -> (ApnsConnection, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let connector = FailingConnector {
            attempts: attempts.clone(),
        };
        (ApnsConnection::with_connector("localhost", connector), attempts)
    }

    /// Takes 100ms per attempt and succeeds over a pipe nobody reads
    #[derive(Default)]
    struct SlowConnector {
        attempts: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        clients: Mutex<Vec<H2Client>>,
        servers: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl Connector for Arc<SlowConnector> {
        fn connect(&self) -> BoxFuture<'static, Result<H2Client, ConnectError>> {
            let this = self.clone();
            this.attempts.fetch_add(1, Ordering::SeqCst);
            let now = this.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            this.max_in_flight.fetch_max(now, Ordering::SeqCst);
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                let (io, server) = tokio::io::duplex(1 << 16);
                let client = H2ClientBuilder::new().build(io).unwrap();
                this.servers.lock().push(server);
                this.clients.lock().push(client.clone());
                this.in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(client)
            }
            .boxed()
        }
    }

    #[test]
    fn test_request_headers() {
        let (conn, _) = failing();
        let headers = conn.request_headers("abc123", 42, NotificationPriority::Delayed, Some("com.example.app"));
        let expected: Vec<(String, String)> = vec![
            (":method", "POST"),
            (":authority", "localhost"),
            (":scheme", "https"),
            (":path", "/3/device/abc123"),
            ("content-length", "42"),
            ("apns-priority", "5"),
            ("apns-topic", "com.example.app"),
        ]
        .into_iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();
        assert_eq!(headers, expected);

        let headers = conn.request_headers("abc123", 2, NotificationPriority::Immediate, None);
        assert_eq!(headers.len(), 6);
        assert_eq!(headers[5], ("apns-priority".to_string(), "10".to_string()));
    }

    #[test]
    fn test_notification_builder() {
        let notification = Notification::new("hi", "token")
            .priority(NotificationPriority::Delayed)
            .topic("com.example.app");
        assert_eq!(notification.payload, Payload::new().alert("hi"));
        assert_eq!(notification.priority.as_u8(), 5);
        assert_eq!(notification.topic.as_deref(), Some("com.example.app"));
    }

    #[tokio::test]
    async fn test_failed_connect_is_shared_then_forgotten() {
        let (conn, attempts) = failing();

        let (a, b) = tokio::join!(conn.ensure_connected(), conn.ensure_connected());
        assert!(matches!(a, Err(ConnectError::Timeout(_))));
        assert!(matches!(b, Err(ConnectError::Timeout(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!conn.connected());

        // The failed attempt is not cached
        assert!(conn.ensure_connected().await.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_as_disconnected() {
        let (conn, _) = failing();
        let result = conn
            .send_message(Payload::new().custom("k", json!(1)), "token", NotificationPriority::Immediate, None)
            .await;
        assert!(matches!(result, Err(ApnsError::Disconnected { reason: None })));
    }

    #[test]
    fn test_disconnect_when_never_connected() {
        let (conn, _) = failing();
        conn.disconnect();
        conn.disconnect();
        assert!(!conn.connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_abandons_connect_in_flight() {
        let connector = Arc::new(SlowConnector::default());
        let conn = ApnsConnection::with_connector("localhost", connector.clone());

        let (early, late) = tokio::join!(conn.ensure_connected(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            conn.disconnect();
            conn.ensure_connected().await
        });

        // The caller that was waiting when the connection was closed fails
        assert!(matches!(early, Err(ConnectError::Abandoned)));
        // The later caller waits out the abandoned attempt, then connects anew
        let late = late.unwrap();
        assert!(late.is_open());
        assert!(conn.connected());

        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(connector.max_in_flight.load(Ordering::SeqCst), 1);
        let clients = connector.clients.lock();
        assert_eq!(clients.len(), 2);
        assert!(!clients[0].is_open());
        assert!(clients[1].is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_connect_surfaces_as_disconnected() {
        let connector = Arc::new(SlowConnector::default());
        let conn = ApnsConnection::with_connector("localhost", connector.clone());

        let (result, ()) = tokio::join!(
            conn.send_message("hi", "token", NotificationPriority::Immediate, None),
            async {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                conn.disconnect();
            }
        );
        assert!(matches!(result, Err(ApnsError::Disconnected { reason: None })));
        assert!(!conn.connected());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }
}
