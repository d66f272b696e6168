pub mod openai;
pub mod reliable;
pub mod traits;

pub use openai::OpenAiCompatibleCompleter;
pub use reliable::ReliableCompleter;
pub use traits::Completer;

use crate::config::ProviderConfig;
use crate::history::Turn;
use crate::util::truncate_with_ellipsis;
use async_trait::async_trait;
use std::time::Duration;

const MAX_ERROR_BODY_CHARS: usize = 300;

/// Failure reported by the completion backend.
#[derive(Debug, thiserror::Error)]
#[error("{context} API error{}: {body}", status_suffix(.status))]
pub struct ApiError {
    pub context: String,
    /// HTTP status, `None` when the response was fine but unusable.
    pub status: Option<u16>,
    pub body: String,
    pub retry_after_ms: Option<u64>,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl ApiError {
    pub fn empty(context: &str) -> Self {
        Self {
            context: context.to_string(),
            status: None,
            body: "response contained no message content".into(),
            retry_after_ms: None,
        }
    }
}

/// Turn a non-success response into an [`ApiError`], keeping a short body excerpt.
pub async fn api_error(context: &str, response: reqwest::Response) -> ApiError {
    let status = response.status().as_u16();
    let retry_after_ms = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .and_then(|secs| u64::try_from(Duration::from_secs_f64(secs).as_millis()).ok());
    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
    ApiError {
        context: context.to_string(),
        status: Some(status),
        body: truncate_with_ellipsis(body.trim(), MAX_ERROR_BODY_CHARS),
        retry_after_ms,
    }
}

/// Stand-in used when no backend URL is configured. Every call fails, so the
/// relay keeps running and reports the problem per message.
pub struct UnconfiguredCompleter;

#[async_trait]
impl Completer for UnconfiguredCompleter {
    async fn complete(&self, _: &str, _: &[Turn], _: &str) -> anyhow::Result<String> {
        anyhow::bail!(
            "provider not configured: set provider.base_url in config.toml or GPT_BASE_URL"
        )
    }
}

/// Build the completer described by `config`, wrapped for retries when
/// `retries > 0`.
pub fn create_completer(config: &ProviderConfig) -> anyhow::Result<Box<dyn Completer>> {
    let Some(base_url) = config
        .base_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
    else {
        tracing::warn!("No provider base_url configured; completions will fail");
        return Ok(Box::new(UnconfiguredCompleter));
    };

    let inner = OpenAiCompatibleCompleter::new(
        base_url,
        config.api_key.as_deref(),
        &config.model,
        config.temperature,
        Duration::from_secs(config.timeout_secs.max(1)),
    )?;

    if config.retries == 0 {
        return Ok(Box::new(inner));
    }
    Ok(Box::new(ReliableCompleter::new(
        Box::new(inner),
        config.retries,
        config.backoff_ms,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_base_url_yields_failing_completer() {
        let completer = create_completer(&ProviderConfig::default()).unwrap();
        let err = completer.complete("sys", &[], "hi").await.unwrap_err();
        assert!(err.to_string().contains("provider not configured"));
    }

    #[test]
    fn configured_provider_builds() {
        let config = ProviderConfig {
            base_url: Some("https://llm.example/v1".into()),
            api_key: Some("sk-test".into()),
            retries: 2,
            ..ProviderConfig::default()
        };
        assert!(create_completer(&config).is_ok());
    }

    #[test]
    fn api_error_display_includes_status() {
        let err = ApiError {
            context: "chat completions".into(),
            status: Some(503),
            body: "overloaded".into(),
            retry_after_ms: None,
        };
        assert_eq!(
            err.to_string(),
            "chat completions API error (503): overloaded"
        );
        assert_eq!(
            ApiError::empty("chat completions").to_string(),
            "chat completions API error: response contained no message content"
        );
    }
}
