//! Reachability probe and the bounded reconnection policy.
//!
//! The probe is a plain TCP connect with a timeout. Its result is advisory:
//! a failed probe is logged, but the socket-level bind/connect is still
//! attempted because ZeroMQ connects lazily and the peer may come up later.
//!
//! [`ReconnectPolicy`] wraps the initial connection sequence. It retries in
//! a loop with a fixed `reconnect_interval` until `max_reconnect_attempts`
//! retries have been made.

use std::{future::Future, time::Duration};

use tokio::{net::TcpStream, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{backoff::Backoff, config::ZmqParams, error::TransferError, Result};

/// Attempts one TCP connection to `host:port` within `timeout`.
pub async fn probe(host: &str, port: u16, timeout: Duration) -> Result<()> {
    match time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(TransferError::Io(e)),
        Err(_) => Err(TransferError::Timeout(timeout)),
    }
}

/// Returns whether `host:port` accepted a TCP connection within `timeout`.
pub async fn check_connectivity(host: &str, port: u16, timeout: Duration) -> bool {
    match probe(host, port, timeout).await {
        Ok(()) => {
            debug!(host, port, "Host reachable");
            true
        }
        Err(e) => {
            warn!(host, port, error = %e, "Host not reachable");
            false
        }
    }
}

/// Probes up to `1 + retries` times, `interval` apart, giving up once
/// `deadline` has elapsed.
pub async fn wait_reachable(
    host: &str,
    port: u16,
    probe_timeout: Duration,
    interval: Duration,
    retries: u32,
    deadline: Duration,
) -> bool {
    let attempts = async {
        let mut backoff = Backoff::fixed(interval, retries);
        loop {
            if probe(host, port, probe_timeout).await.is_ok() {
                return true;
            }
            match backoff.next_sleep() {
                Ok(delay) => time::sleep(delay).await,
                Err(_) => return false,
            }
        }
    };

    match time::timeout(deadline, attempts).await {
        Ok(reachable) => reachable,
        Err(_) => false,
    }
}

/// Bounded retry loop for the initial connection sequence.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    enabled: bool,
    backoff: Backoff,
}

impl ReconnectPolicy {
    pub fn new(enabled: bool, interval: Duration, max_attempts: u32) -> Self {
        Self {
            enabled,
            backoff: Backoff::fixed(interval, max_attempts),
        }
    }

    pub fn from_params(params: &ZmqParams) -> Self {
        Self::new(
            params.auto_reconnect,
            params.reconnect_interval(),
            params.max_reconnect_attempts,
        )
    }

    /// Retries made so far.
    pub fn attempts(&self) -> u32 {
        self.backoff.attempt().min(self.backoff.max_attempts())
    }

    /// Runs `attempt` until it succeeds, the retry budget is exhausted, or
    /// `cancel` fires. `on_retry(n, delay)` is called before the n-th retry.
    ///
    /// Configuration errors are returned immediately; retrying cannot fix
    /// them.
    pub async fn run<T, F, Fut, R>(
        &mut self,
        cancel: &CancellationToken,
        mut on_retry: R,
        mut attempt: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(u32, Duration),
    {
        self.backoff.reset();
        loop {
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.enabled || !is_retryable(&err) {
                return Err(err);
            }

            let delay = match self.backoff.next_sleep() {
                Ok(delay) => delay,
                Err(exhausted) => {
                    error!(
                        attempts = self.attempts(),
                        last_error = %err,
                        "Connection failed, giving up"
                    );
                    return Err(exhausted.into());
                }
            };

            let retry = self.backoff.attempt();
            warn!(retry, ?delay, error = %err, "Connection attempt failed, retrying");
            on_retry(retry, delay);

            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::NotRunning),
                _ = time::sleep(delay) => {}
            }
        }
    }
}

fn is_retryable(err: &TransferError) -> bool {
    err.is_transient() || matches!(err, TransferError::Bind { .. } | TransferError::Connect { .. })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use tokio::{net::TcpListener, time::Instant};

    use super::*;

    fn refused() -> TransferError {
        TransferError::Connect {
            endpoint: "tcp://127.0.0.1:1".into(),
            source: zmq::Error::ECONNREFUSED,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_max_retries_spaced_by_interval() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(5), 3);
        let calls = Arc::new(AtomicU32::new(0));
        let mut retries = Vec::new();
        let started = Instant::now();

        let result: Result<()> = policy
            .run(
                &CancellationToken::new(),
                |n, delay| retries.push((n, delay)),
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(refused()) }
                },
            )
            .await;

        assert!(matches!(result, Err(TransferError::RetriesPolicy(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            retries,
            vec![
                (1, Duration::from_secs(5)),
                (2, Duration::from_secs(5)),
                (3, Duration::from_secs(5)),
            ]
        );
        assert_eq!(policy.attempts(), 3);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(started.elapsed() < Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_failures() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(1), 5);
        let calls = AtomicU32::new(0);

        let value = policy
            .run(&CancellationToken::new(), |_, _| {}, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(refused())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(policy.attempts(), 2);
    }

    #[tokio::test]
    async fn test_disabled_policy_fails_once() {
        let mut policy = ReconnectPolicy::new(false, Duration::from_secs(5), 3);
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run(&CancellationToken::new(), |_, _| {}, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(refused()) }
            })
            .await;

        assert!(matches!(result, Err(TransferError::Connect { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_configuration_errors_are_not_retried() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(5), 3);
        let result: Result<()> = policy
            .run(&CancellationToken::new(), |_, _| {}, || async {
                Err(TransferError::UnknownSocket("telemetry".into()))
            })
            .await;
        assert!(matches!(result, Err(TransferError::UnknownSocket(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_wait() {
        let mut policy = ReconnectPolicy::new(true, Duration::from_secs(60), 3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result: Result<()> = policy
            .run(&cancel, |_, _| trigger.cancel(), || async { Err(refused()) })
            .await;

        assert!(matches!(result, Err(TransferError::NotRunning)));
    }

    #[tokio::test]
    async fn test_probe_reachable_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(check_connectivity("127.0.0.1", port, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_probe_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!check_connectivity("127.0.0.1", port, Duration::from_secs(1)).await);
        assert!(
            !wait_reachable(
                "127.0.0.1",
                port,
                Duration::from_millis(200),
                Duration::from_millis(10),
                2,
                Duration::from_secs(2),
            )
            .await
        );
    }
}
