use eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Classification of one driver call, as seen by the job runner's policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CallKind {
    /// A valid business answer, even if "not found".
    Success,
    /// 429 / 5xx / network hiccup; eligible for retry.
    Transient,
    /// 401/403 or a parsed invalid/expired-token message.
    AuthInvalid,
    /// 402 or a parsed billing / insufficient-funds message.
    Billing,
    /// Explicit over-quota signal.
    QuotaExhausted,
    /// Other 4xx / malformed input; not retried.
    ClientError,
    /// Unrecoverable condition; aborts the run.
    Fatal,
    Cancelled,
}

impl CallKind {
    /// Kinds that permanently retire the credential for this run.
    pub fn retires_credential(self) -> bool {
        matches!(
            self,
            CallKind::AuthInvalid | CallKind::Billing | CallKind::QuotaExhausted
        )
    }
}

/// Result of one classified call against the third-party API.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub kind: CallKind,
    pub http_status: u16,
    /// Credits actually consumed, as reported by the remote (0 when nothing
    /// was consumed or the remote did not say).
    pub cost_actual: u32,
    pub parsed: Value,
    pub message: Option<String>,
}

impl CallOutcome {
    pub fn cancelled() -> Self {
        Self {
            kind: CallKind::Cancelled,
            http_status: 0,
            cost_actual: 0,
            parsed: Value::Null,
            message: None,
        }
    }

    fn transient(message: String) -> Self {
        Self {
            kind: CallKind::Transient,
            http_status: 0,
            cost_actual: 0,
            parsed: Value::Null,
            message: Some(message),
        }
    }
}

/// Adapter performing a single call against the third-party API with a
/// supplied credential. Implementations classify the response; they never
/// retry and never write to stdout.
pub trait ActorDriver: Send + Sync {
    fn call_once(
        &self,
        token: &str,
        request: &Value,
    ) -> impl Future<Output = Result<CallOutcome>> + Send;
}

/// Backoff before retry `attempt` (0-based): `min(15000 ms, 750 × 2^attempt)`.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.min(32);
    Duration::from_millis(750u64.saturating_mul(1u64 << exp).min(15_000))
}

/// Drive one request to a terminal classification: per-attempt wall-clock
/// timeout, bounded retry on transient outcomes, cancel-aware backoff sleeps.
///
/// An in-flight call is never aborted by cancellation; only the sleeps
/// between attempts observe the token. A timeout counts as transient unless
/// it happens on the final attempt, where it becomes a client error.
pub async fn call_with_retry<D: ActorDriver>(
    driver: &D,
    token: &str,
    request: &Value,
    retry_max: u32,
    call_timeout: Duration,
    cancel: &CancellationToken,
) -> CallOutcome {
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return CallOutcome::cancelled();
        }

        let outcome = match tokio::time::timeout(call_timeout, driver.call_once(token, request))
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => CallOutcome::transient(err.to_string()),
            Err(_) => {
                if attempt >= retry_max {
                    return CallOutcome {
                        kind: CallKind::ClientError,
                        http_status: 0,
                        cost_actual: 0,
                        parsed: Value::Null,
                        message: Some(format!(
                            "call timed out after {}s on final attempt",
                            call_timeout.as_secs()
                        )),
                    };
                }
                CallOutcome::transient(format!(
                    "call timed out after {}s",
                    call_timeout.as_secs()
                ))
            }
        };

        if outcome.kind != CallKind::Transient || attempt >= retry_max {
            return outcome;
        }

        let delay = backoff_delay(attempt);
        tracing::warn!(
            attempt,
            sleep_ms = delay.as_millis() as u64,
            reason = outcome.message.as_deref().unwrap_or(""),
            "transient failure; backing off"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return CallOutcome::cancelled(),
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays a scripted sequence of outcomes, then repeats the last one.
    struct ScriptedDriver {
        outcomes: Mutex<Vec<CallOutcome>>,
        calls: AtomicUsize,
        hang: bool,
    }

    impl ScriptedDriver {
        fn new(outcomes: Vec<CallOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                outcomes: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                hang: true,
            }
        }
    }

    impl ActorDriver for ScriptedDriver {
        async fn call_once(&self, _token: &str, _request: &Value) -> Result<CallOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                Ok(outcomes.remove(0))
            } else {
                Ok(outcomes[0].clone())
            }
        }
    }

    fn success() -> CallOutcome {
        CallOutcome {
            kind: CallKind::Success,
            http_status: 200,
            cost_actual: 1,
            parsed: json!({"items": []}),
            message: None,
        }
    }

    fn transient() -> CallOutcome {
        CallOutcome::transient("429".into())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(750));
        assert_eq!(backoff_delay(1), Duration::from_millis(1500));
        assert_eq!(backoff_delay(3), Duration::from_millis(6000));
        assert_eq!(backoff_delay(5), Duration::from_millis(15_000));
        assert_eq!(backoff_delay(31), Duration::from_millis(15_000));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_storm_retries_until_success() {
        let driver = ScriptedDriver::new(vec![transient(), transient(), success()]);
        let cancel = CancellationToken::new();
        let outcome = call_with_retry(
            &driver,
            "tok",
            &json!({}),
            5,
            Duration::from_secs(120),
            &cancel,
        )
        .await;
        assert_eq!(outcome.kind, CallKind::Success);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_exhaustion_returns_transient() {
        let driver = ScriptedDriver::new(vec![transient()]);
        let cancel = CancellationToken::new();
        let outcome = call_with_retry(
            &driver,
            "tok",
            &json!({}),
            2,
            Duration::from_secs(120),
            &cancel,
        )
        .await;
        assert_eq!(outcome.kind, CallKind::Transient);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_returns_immediately() {
        let driver = ScriptedDriver::new(vec![transient()]);
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            child.cancel();
        });
        let outcome = call_with_retry(
            &driver,
            "tok",
            &json!({}),
            5,
            Duration::from_secs(120),
            &cancel,
        )
        .await;
        assert_eq!(outcome.kind, CallKind::Cancelled);
        // Only the first attempt ran; the backoff sleep observed the cancel.
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_transient_then_client_error_on_last_attempt() {
        let driver = ScriptedDriver::hanging();
        let cancel = CancellationToken::new();
        let outcome = call_with_retry(
            &driver,
            "tok",
            &json!({}),
            1,
            Duration::from_secs(10),
            &cancel,
        )
        .await;
        assert_eq!(outcome.kind, CallKind::ClientError);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 2);
    }
}
