use super::traits::Completer;
use super::{ApiError, api_error};
use crate::history::Turn;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Any backend speaking the OpenAI `/chat/completions` protocol.
pub struct OpenAiCompatibleCompleter {
    base_url: String,
    credential: Option<String>,
    model: String,
    temperature: Option<f64>,
    client: Client,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning/thinking models may return output in `reasoning_content`.
    #[serde(default)]
    reasoning_content: Option<String>,
}

impl ResponseMessage {
    fn effective_content(self) -> Option<String> {
        match self.content {
            Some(c) if !c.trim().is_empty() => Some(c),
            _ => self.reasoning_content.filter(|r| !r.trim().is_empty()),
        }
    }
}

impl OpenAiCompatibleCompleter {
    /// `base_url` is the API root, e.g. `https://api.openai.com/v1`; trailing
    /// slashes are ignored.
    pub fn new(
        base_url: &str,
        credential: Option<&str>,
        model: &str,
        temperature: Option<f64>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            credential: credential
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(ToString::to_string),
            model: model.to_string(),
            temperature,
            client,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn build_messages<'a>(
        system_prompt: &'a str,
        history: &'a [Turn],
        user_message: &'a str,
    ) -> Vec<Message<'a>> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !system_prompt.is_empty() {
            messages.push(Message {
                role: "system",
                content: system_prompt,
            });
        }
        messages.extend(history.iter().map(|turn| Message {
            role: turn.role.as_str(),
            content: &turn.content,
        }));
        messages.push(Message {
            role: "user",
            content: user_message,
        });
        messages
    }
}

#[async_trait]
impl Completer for OpenAiCompatibleCompleter {
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[Turn],
        user_message: &str,
    ) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: Self::build_messages(system_prompt, history, user_message),
            temperature: self.temperature,
        };

        let mut builder = self.client.post(self.endpoint()).json(&request);
        if let Some(credential) = &self.credential {
            builder = builder.header("Authorization", format!("Bearer {credential}"));
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            return Err(api_error("chat completions", response).await.into());
        }

        let chat_response: ChatResponse = response.json().await?;
        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.effective_content())
            .ok_or_else(|| ApiError::empty("chat completions").into())
    }

    async fn warmup(&self) -> anyhow::Result<()> {
        if let Some(credential) = self.credential.as_ref() {
            self.client
                .get(format!("{}/models", self.base_url))
                .header("Authorization", format!("Bearer {credential}"))
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::Turn;

    fn completer(base: &str) -> OpenAiCompatibleCompleter {
        OpenAiCompatibleCompleter::new(base, Some("sk-test"), "gpt-4o", None, Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn endpoint_strips_trailing_slash() {
        assert_eq!(
            completer("https://llm.example/v1/").endpoint(),
            "https://llm.example/v1/chat/completions"
        );
    }

    #[test]
    fn blank_key_is_treated_as_missing() {
        let c = OpenAiCompatibleCompleter::new(
            "http://localhost",
            Some("  "),
            "m",
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(c.credential.is_none());
    }

    #[test]
    fn messages_are_system_then_history_then_user() {
        let history = vec![Turn::user("hi"), Turn::assistant("hello!")];
        let messages =
            OpenAiCompatibleCompleter::build_messages("be brief", &history, "how are you?");
        let roles: Vec<&str> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[3].content, "how are you?");
    }

    #[test]
    fn request_omits_unset_temperature() {
        let request = ChatRequest {
            model: "m",
            messages: vec![],
            temperature: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn reasoning_content_is_used_when_content_is_empty() {
        let message = ResponseMessage {
            content: Some(String::new()),
            reasoning_content: Some("thought".into()),
        };
        assert_eq!(message.effective_content().as_deref(), Some("thought"));

        let empty = ResponseMessage {
            content: None,
            reasoning_content: None,
        };
        assert!(empty.effective_content().is_none());
    }
}
