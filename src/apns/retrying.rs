//! Resending notifications across disconnects
//!
//! [`RetryingProxy`] wraps a [`Notifier`] and resends a notification whenever
//! it fails because the connection went away, sleeping between attempts with
//! a delay that doubles each time. Rejections are final and returned as is.
//! There is no attempt limit; bound the whole call with
//! `tokio::time::timeout` if needed.

use super::connection::{Notification, NotificationPriority, Notifier};
use super::error::ApnsError;
use super::payload::Payload;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay before the first resend
pub const DEFAULT_RESEND_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct RetryingProxy<N> {
    inner: N,
    resend_timeout: Duration,
}

impl<N: Notifier> RetryingProxy<N> {
    pub fn new(inner: N) -> Self {
        RetryingProxy {
            inner,
            resend_timeout: DEFAULT_RESEND_TIMEOUT,
        }
    }

    /// Set the delay before the first resend
    pub fn with_resend_timeout(mut self, timeout: Duration) -> Self {
        self.resend_timeout = timeout;
        self
    }

    /// The wrapped notifier
    pub fn get_ref(&self) -> &N {
        &self.inner
    }

    pub fn into_inner(self) -> N {
        self.inner
    }

    /// Send until delivered or rejected
    pub async fn send(&self, notification: &Notification) -> Result<Option<String>, ApnsError> {
        let mut delay = self.resend_timeout;
        let mut attempt: u32 = 1;
        loop {
            match self.inner.send(notification).await {
                Err(ApnsError::Disconnected { reason }) => {
                    warn!(
                        attempt,
                        reason = reason.as_deref().unwrap_or("none"),
                        delay_ms = delay.as_millis() as u64,
                        "notification not delivered, resending"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt = attempt.saturating_add(1);
                }
                outcome => {
                    if attempt > 1 {
                        debug!(attempt, "resend finished");
                    }
                    return outcome;
                }
            }
        }
    }

    /// Same as [`ApnsConnection::send_message`](super::ApnsConnection::send_message), with resends
    pub async fn send_message(
        &self,
        payload: impl Into<Payload>,
        token: &str,
        priority: NotificationPriority,
        topic: Option<&str>,
    ) -> Result<Option<String>, ApnsError> {
        let mut notification = Notification::new(payload, token).priority(priority);
        notification.topic = topic.map(str::to_string);
        self.send(&notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::{BoxFuture, FutureExt};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Plays back scripted outcomes, one per send
    struct Scripted {
        outcomes: Mutex<VecDeque<Result<Option<String>, ApnsError>>>,
        sent: Mutex<Vec<Notification>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<Option<String>, ApnsError>>) -> Self {
            Scripted {
                outcomes: Mutex::new(outcomes.into()),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl Notifier for Scripted {
        fn send<'a>(&'a self, notification: &'a Notification) -> BoxFuture<'a, Result<Option<String>, ApnsError>> {
            self.sent.lock().push(notification.clone());
            let outcome = self.outcomes.lock().pop_front().unwrap_or(Ok(None));
            async move { outcome }.boxed()
        }
    }

    fn disconnected() -> Result<Option<String>, ApnsError> {
        Err(ApnsError::Disconnected { reason: None })
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_until_success() {
        let proxy = RetryingProxy::new(Scripted::new(vec![
            disconnected(),
            disconnected(),
            Ok(Some("id".to_string())),
        ]));

        let start = tokio::time::Instant::now();
        let result = proxy.send_message("hi", "token", NotificationPriority::Immediate, None).await;
        assert_eq!(result.unwrap(), Some("id".to_string()));
        assert_eq!(start.elapsed(), Duration::from_millis(1500));

        let sent = proxy.get_ref().sent.lock();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|n| *n == sent[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_retried() {
        let proxy = RetryingProxy::new(Scripted::new(vec![Err(ApnsError::Rejected {
            status: 400,
            reason: Some("BadDeviceToken".into()),
            apns_id: None,
        })]));

        let start = tokio::time::Instant::now();
        let result = proxy.send(&Notification::new("hi", "token")).await;
        assert!(matches!(result, Err(ApnsError::Rejected { status: 400, .. })));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(proxy.get_ref().sent.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_resend_timeout() {
        let proxy = RetryingProxy::new(Scripted::new(vec![disconnected(), Ok(None)]))
            .with_resend_timeout(Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        assert_eq!(proxy.send(&Notification::new("hi", "token")).await.unwrap(), None);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }
}
