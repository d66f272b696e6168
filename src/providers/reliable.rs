use super::ApiError;
use super::traits::Completer;
use crate::history::Turn;
use async_trait::async_trait;
use std::time::Duration;

/// Longest wait a `Retry-After` hint may impose.
const MAX_RETRY_AFTER_MS: u64 = 30_000;
const MAX_BACKOFF_MS: u64 = 10_000;

/// Retry only what might succeed next time: network failures, timeouts,
/// 408, 429 and 5xx.
fn is_retryable(err: &anyhow::Error) -> bool {
    if let Some(api) = err.downcast_ref::<ApiError>() {
        return match api.status {
            Some(code) => code == 408 || code == 429 || (500..600).contains(&code),
            None => false,
        };
    }
    if let Some(reqwest_err) = err.downcast_ref::<reqwest::Error>() {
        if let Some(status) = reqwest_err.status() {
            let code = status.as_u16();
            return code == 408 || code == 429 || status.is_server_error();
        }
        return reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request();
    }
    false
}

fn retry_after_ms(err: &anyhow::Error) -> Option<u64> {
    err.downcast_ref::<ApiError>().and_then(|api| api.retry_after_ms)
}

/// Completer wrapper with bounded retries and exponential backoff.
pub struct ReliableCompleter {
    inner: Box<dyn Completer>,
    max_retries: u32,
    base_backoff_ms: u64,
}

impl ReliableCompleter {
    pub fn new(inner: Box<dyn Completer>, max_retries: u32, base_backoff_ms: u64) -> Self {
        Self {
            inner,
            max_retries,
            base_backoff_ms: base_backoff_ms.max(50),
        }
    }

    /// Compute backoff duration, respecting Retry-After if present.
    fn compute_backoff(base: u64, err: &anyhow::Error) -> u64 {
        match retry_after_ms(err) {
            Some(retry_after) => retry_after.min(MAX_RETRY_AFTER_MS).max(base),
            None => base,
        }
    }
}

#[async_trait]
impl Completer for ReliableCompleter {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[Turn],
        user_message: &str,
    ) -> anyhow::Result<String> {
        let mut backoff_ms = self.base_backoff_ms;
        let mut attempt = 0;

        loop {
            match self
                .inner
                .complete(system_prompt, history, user_message)
                .await
            {
                Ok(reply) => {
                    if attempt > 0 {
                        tracing::info!(attempt, "Completion recovered after retry");
                    }
                    return Ok(reply);
                }
                Err(e) => {
                    if attempt >= self.max_retries || !is_retryable(&e) {
                        if attempt > 0 {
                            return Err(e.context(format!(
                                "completion failed after {} attempts",
                                attempt + 1
                            )));
                        }
                        return Err(e);
                    }

                    let wait = Self::compute_backoff(backoff_ms, &e);
                    tracing::warn!(
                        attempt = attempt + 1,
                        backoff_ms = wait,
                        "Completion failed, retrying: {e:#}"
                    );
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                    backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
                    attempt += 1;
                }
            }
        }
    }

    async fn warmup(&self) -> anyhow::Result<()> {
        self.inner.warmup().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Scripted {
        outcomes: Mutex<Vec<anyhow::Result<String>>>,
        calls: Arc<Mutex<u32>>,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<anyhow::Result<String>>) -> (Self, Arc<Mutex<u32>>) {
            outcomes.reverse();
            let calls = Arc::new(Mutex::new(0));
            (
                Self {
                    outcomes: Mutex::new(outcomes),
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl Completer for Scripted {
        async fn complete(&self, _: &str, _: &[Turn], _: &str) -> anyhow::Result<String> {
            *self.calls.lock() += 1;
            self.outcomes
                .lock()
                .pop()
                .unwrap_or_else(|| Ok("fallback".into()))
        }
    }

    fn status(code: u16) -> anyhow::Error {
        ApiError {
            context: "test".into(),
            status: Some(code),
            body: "nope".into(),
            retry_after_ms: None,
        }
        .into()
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let (inner, calls) = Scripted::new(vec![Err(status(503)), Err(status(429)), Ok("hi".into())]);
        let completer = ReliableCompleter::new(Box::new(inner), 2, 1);
        assert_eq!(completer.complete("", &[], "x").await.unwrap(), "hi");
        assert_eq!(*calls.lock(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (inner, calls) = Scripted::new(vec![Err(status(401))]);
        let completer = ReliableCompleter::new(Box::new(inner), 3, 1);
        assert!(completer.complete("", &[], "x").await.is_err());
        assert_eq!(*calls.lock(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (inner, calls) =
            Scripted::new(vec![Err(status(500)), Err(status(500)), Err(status(500))]);
        let completer = ReliableCompleter::new(Box::new(inner), 1, 1);
        let err = completer.complete("", &[], "x").await.unwrap_err();
        assert!(format!("{err:#}").contains("after 2 attempts"));
        assert_eq!(*calls.lock(), 2);
    }

    #[test]
    fn backoff_honours_retry_after_with_cap() {
        let err: anyhow::Error = ApiError {
            context: "test".into(),
            status: Some(429),
            body: String::new(),
            retry_after_ms: Some(120_000),
        }
        .into();
        assert_eq!(ReliableCompleter::compute_backoff(500, &err), MAX_RETRY_AFTER_MS);
        assert_eq!(ReliableCompleter::compute_backoff(500, &status(503)), 500);
    }

    #[test]
    fn empty_reply_is_not_retryable() {
        assert!(!is_retryable(&ApiError::empty("x").into()));
        assert!(is_retryable(&status(408)));
    }
}
