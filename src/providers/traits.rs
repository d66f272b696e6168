use crate::history::Turn;
use async_trait::async_trait;

/// Produces the assistant's reply for one user message.
#[async_trait]
pub trait Completer: Send + Sync {
    /// `history` holds prior turns only, oldest first; `user_message` is the
    /// message being answered.
    async fn complete(
        &self,
        system_prompt: &str,
        history: &[Turn],
        user_message: &str,
    ) -> anyhow::Result<String>;

    /// Warm up the HTTP connection pool. No-op by default.
    async fn warmup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
