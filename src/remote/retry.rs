//! Connect timeout and bounded retry.
//!
//! The defaults make a single attempt with no timeout; a stalled handshake
//! is then only noticed through the remote's own error or close.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tracing::warn;
use uuid::Uuid;

use super::{ConnectParams, RemoteConnector, RemoteError, RemoteEventSink, RemoteSession};

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Per-attempt handshake timeout
    pub timeout: Option<Duration>,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
            timeout: None,
        }
    }
}

impl ConnectPolicy {
    /// Delay before attempt `attempt + 1`: exponential in `attempt`, capped,
    /// plus up to 50% random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay);
        let jitter_range = exp.as_millis() as u64 / 2;
        let jitter = if jitter_range == 0 {
            0
        } else {
            (Uuid::new_v4().as_u128() % (jitter_range as u128 + 1)) as u64
        };
        exp + Duration::from_millis(jitter)
    }
}

fn retryable(error: &RemoteError) -> bool {
    !matches!(error, RemoteError::MissingApiKey)
}

/// Connect through `connector`, honouring the timeout and retry settings.
pub fn connect_with_policy(
    connector: Arc<dyn RemoteConnector>,
    params: ConnectParams,
    events: RemoteEventSink,
    policy: ConnectPolicy,
) -> BoxFuture<'static, Result<Box<dyn RemoteSession>, RemoteError>> {
    Box::pin(async move {
        let attempts = policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let pending = connector.connect(params.clone(), Arc::clone(&events));
            let result = match policy.timeout {
                Some(limit) => tokio::time::timeout(limit, pending)
                    .await
                    .unwrap_or(Err(RemoteError::Timeout(limit))),
                None => pending.await,
            };

            match result {
                Ok(session) => return Ok(session),
                Err(e) if attempt < attempts && retryable(&e) => {
                    let delay = policy.backoff(attempt);
                    warn!(attempt, max_attempts = attempts, delay_ms = delay.as_millis() as u64, "Connect failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{RealtimeInput, RemoteEvent};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct NullSession;

    impl RemoteSession for NullSession {
        fn send_realtime_input(&mut self, _input: RealtimeInput) -> Result<(), RemoteError> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    /// Fails the first `failures` attempts, optionally hanging instead.
    struct Flaky {
        failures: u32,
        hang: bool,
        calls: Arc<AtomicU32>,
    }

    impl RemoteConnector for Flaky {
        fn connect(&self, _params: ConnectParams, _events: RemoteEventSink) -> BoxFuture<'static, Result<Box<dyn RemoteSession>, RemoteError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let failures = self.failures;
            let hang = self.hang;
            Box::pin(async move {
                if call <= failures {
                    if hang {
                        futures_util::future::pending::<()>().await;
                    }
                    return Err(RemoteError::Connect(format!("attempt {} refused", call)));
                }
                let session: Box<dyn RemoteSession> = Box::new(NullSession);
                Ok(session)
            })
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    fn sink() -> RemoteEventSink {
        Arc::new(|_: RemoteEvent| {})
    }

    fn fast_policy(max_attempts: u32) -> ConnectPolicy {
        ConnectPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_default_policy_makes_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = Arc::new(Flaky { failures: 1, hang: false, calls: Arc::clone(&calls) });
        let result = connect_with_policy(connector, ConnectParams::default(), sink(), ConnectPolicy::default()).await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = Arc::new(Flaky { failures: 2, hang: false, calls: Arc::clone(&calls) });
        let result = connect_with_policy(connector, ConnectParams::default(), sink(), fast_policy(3)).await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_applies_per_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let connector = Arc::new(Flaky { failures: 5, hang: true, calls: Arc::clone(&calls) });
        let policy = ConnectPolicy {
            timeout: Some(Duration::from_millis(20)),
            ..fast_policy(2)
        };
        let result = connect_with_policy(connector, ConnectParams::default(), sink(), policy).await;
        assert!(matches!(result, Err(RemoteError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_is_capped_with_bounded_jitter() {
        let policy = ConnectPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            timeout: None,
        };
        let first = policy.backoff(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let late = policy.backoff(8);
        assert!(late >= Duration::from_millis(400) && late <= Duration::from_millis(600));
    }
}
