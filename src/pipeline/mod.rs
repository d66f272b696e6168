//! Inbound message handling.
//!
//! [`MessagePipeline::handle_inbound`] announces every message, filters out
//! what should not be answered, intercepts the AI on/off commands and hands
//! everything else to the [`Limiter`] as an isolated completion task.

pub mod types;

pub use types::{InboundMessage, MessageKind, OutboundReply, ReplyTransport, SenderMeta};

use crate::concurrency::{Limiter, LimiterStats, TaskHandle};
use crate::config::PipelineConfig;
use crate::history::{HistoryStore, Turn};
use crate::providers::Completer;
use crate::status_events::{ErrorPayload, MessageNotice, StatusEvent, StatusSink};
use crate::util::preview;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("completion failed: {0}")]
    Completion(String),
    #[error("reply delivery failed: {0}")]
    Send(String),
}

/// Control command recognised in a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    EnableAi,
    DisableAi,
}

/// Command words, matched against the trimmed body ignoring case.
#[derive(Debug, Clone)]
pub struct CommandSet {
    enable: String,
    disable: String,
}

impl CommandSet {
    pub fn new(enable: &str, disable: &str) -> Self {
        Self {
            enable: enable.trim().to_lowercase(),
            disable: disable.trim().to_lowercase(),
        }
    }

    pub fn parse(&self, body: &str) -> Option<Command> {
        let normalized = body.trim().to_lowercase();
        if normalized == self.enable {
            Some(Command::EnableAi)
        } else if normalized == self.disable {
            Some(Command::DisableAi)
        } else {
            None
        }
    }
}

impl Default for CommandSet {
    fn default() -> Self {
        Self::new("/ai on", "/ai off")
    }
}

/// What `handle_inbound` did with a message.
#[must_use]
pub enum Dispatch {
    /// Own message, non-text or blank body.
    Dropped,
    /// AI toggle command; carries the new toggle value.
    Command { enabled: bool },
    /// AI replies are off; nothing was sent.
    Disabled,
    /// Completion task handed to the limiter.
    Queued(TaskHandle<Result<(), PipelineError>>),
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dropped => f.write_str("Dropped"),
            Self::Command { enabled } => write!(f, "Command {{ enabled: {enabled} }}"),
            Self::Disabled => f.write_str("Disabled"),
            Self::Queued(_) => f.write_str("Queued"),
        }
    }
}

/// Shared pieces a completion task needs after `handle_inbound` has returned.
struct Worker {
    history: Arc<HistoryStore>,
    completer: Arc<dyn Completer>,
    transport: Arc<dyn ReplyTransport>,
    sink: Arc<dyn StatusSink>,
    system_prompt: String,
}

pub struct MessagePipeline {
    ai_enabled: AtomicBool,
    limiter: Arc<Limiter>,
    commands: CommandSet,
    enabled_reply: String,
    disabled_reply: String,
    worker: Arc<Worker>,
}

impl MessagePipeline {
    pub fn new(
        config: &PipelineConfig,
        limiter: Arc<Limiter>,
        history: Arc<HistoryStore>,
        completer: Arc<dyn Completer>,
        transport: Arc<dyn ReplyTransport>,
        sink: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            ai_enabled: AtomicBool::new(true),
            limiter,
            commands: CommandSet::new(&config.enable_command, &config.disable_command),
            enabled_reply: config.enabled_reply.clone(),
            disabled_reply: config.disabled_reply.clone(),
            worker: Arc::new(Worker {
                history,
                completer,
                transport,
                sink,
                system_prompt: config.system_prompt.clone(),
            }),
        }
    }

    pub fn limiter_stats(&self) -> LimiterStats {
        self.limiter.stats()
    }

    pub fn ai_enabled(&self) -> bool {
        self.ai_enabled.load(Ordering::SeqCst)
    }

    /// Set the toggle and announce it. Returns the new value.
    pub fn set_ai_enabled(&self, enabled: bool) -> bool {
        self.ai_enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "AI responses toggled");
        self.worker
            .sink
            .notify(StatusEvent::Toggle { ai_enabled: enabled });
        enabled
    }

    /// Flip the toggle and announce it. Returns the new value.
    pub fn toggle_ai(&self) -> bool {
        let enabled = !self.ai_enabled.fetch_xor(true, Ordering::SeqCst);
        tracing::info!(enabled, "AI responses toggled");
        self.worker
            .sink
            .notify(StatusEvent::Toggle { ai_enabled: enabled });
        enabled
    }

    /// Process one inbound message. Never waits on the model; completion work
    /// runs on the limiter.
    pub async fn handle_inbound(&self, msg: InboundMessage) -> Dispatch {
        self.worker
            .sink
            .notify(StatusEvent::Message(observed_notice(&msg)));

        if msg.from_self || msg.kind != MessageKind::Chat || msg.body.trim().is_empty() {
            return Dispatch::Dropped;
        }

        if let Some(command) = self.commands.parse(&msg.body) {
            let enabled = command == Command::EnableAi;
            self.ai_enabled.store(enabled, Ordering::SeqCst);
            tracing::info!(chat_id = %msg.chat_id, enabled, "AI toggled by chat command");

            let text = if enabled {
                &self.enabled_reply
            } else {
                &self.disabled_reply
            };
            let reply = OutboundReply {
                chat_id: msg.chat_id.clone(),
                quoted_message_id: Some(msg.id.clone()),
                text: text.clone(),
                timestamp: Utc::now(),
            };
            if let Err(e) = self.worker.transport.send_reply(&reply).await {
                tracing::warn!(chat_id = %msg.chat_id, "Failed to confirm toggle: {e:#}");
            }
            self.worker
                .sink
                .notify(StatusEvent::Toggle { ai_enabled: enabled });
            return Dispatch::Command { enabled };
        }

        if !self.ai_enabled() {
            tracing::debug!(chat_id = %msg.chat_id, "AI disabled; not replying");
            return Dispatch::Disabled;
        }

        tracing::info!(
            chat_id = %msg.chat_id,
            "Queued message: {}",
            preview(&msg.body)
        );
        let worker = Arc::clone(&self.worker);
        Dispatch::Queued(self.limiter.schedule(move || async move { worker.respond(msg).await }))
    }
}

impl Worker {
    async fn respond(&self, msg: InboundMessage) -> Result<(), PipelineError> {
        let history = self.history.load(&msg.chat_id).await;

        let answer = match self
            .completer
            .complete(&self.system_prompt, &history, &msg.body)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                let reason = format!("{e:#}");
                tracing::error!(chat_id = %msg.chat_id, message_id = %msg.id, "Completion failed: {reason}");
                self.sink.notify(StatusEvent::Error(ErrorPayload {
                    chat_id: Some(msg.chat_id.clone()),
                    message_id: Some(msg.id.clone()),
                    message: reason.clone(),
                }));
                return Err(PipelineError::Completion(reason));
            }
        };

        if let Err(e) = self
            .history
            .append(
                &msg.chat_id,
                &[Turn::user(msg.body.clone()), Turn::assistant(answer.clone())],
            )
            .await
        {
            tracing::error!(chat_id = %msg.chat_id, "History not saved: {e}");
        }

        let reply = OutboundReply {
            chat_id: msg.chat_id.clone(),
            quoted_message_id: Some(msg.id.clone()),
            text: answer,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.transport.send_reply(&reply).await {
            let reason = format!("{e:#}");
            tracing::error!(chat_id = %msg.chat_id, "Reply not delivered: {reason}");
            self.sink.notify(StatusEvent::Error(ErrorPayload {
                chat_id: Some(msg.chat_id.clone()),
                message_id: Some(msg.id.clone()),
                message: format!("reply delivery failed: {reason}"),
            }));
            return Err(PipelineError::Send(reason));
        }

        tracing::info!(chat_id = %msg.chat_id, "Replied: {}", preview(&reply.text));
        self.sink.notify(StatusEvent::Message(MessageNotice::Outbound {
            id: format!("bot_{}", msg.id),
            to: reply.chat_id,
            text: reply.text,
            quoted_msg_id: reply.quoted_message_id,
            timestamp: reply.timestamp.to_rfc3339(),
        }));
        Ok(())
    }
}

fn observed_notice(msg: &InboundMessage) -> MessageNotice {
    MessageNotice::Inbound {
        id: msg.id.clone(),
        chat_id: msg.chat_id.clone(),
        from: msg.sender.id.clone(),
        sender_name: msg.sender.display_name.clone(),
        text: msg.body.clone(),
        is_group: msg.is_group,
        timestamp: msg.timestamp.to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryTurnStorage;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<StatusEvent>>,
    }

    impl StatusSink for RecordingSink {
        fn notify(&self, event: StatusEvent) {
            self.events.lock().push(event);
        }
    }

    impl RecordingSink {
        fn kinds(&self) -> Vec<&'static str> {
            self.events.lock().iter().map(StatusEvent::kind).collect()
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutboundReply>>,
    }

    #[async_trait]
    impl ReplyTransport for RecordingTransport {
        async fn send_reply(&self, reply: &OutboundReply) -> anyhow::Result<()> {
            self.sent.lock().push(reply.clone());
            Ok(())
        }
    }

    struct EchoCompleter {
        seen_history: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Completer for EchoCompleter {
        async fn complete(&self, _: &str, history: &[Turn], user: &str) -> anyhow::Result<String> {
            self.seen_history.lock().push(history.len());
            Ok(format!("echo: {user}"))
        }
    }

    struct Fixture {
        pipeline: MessagePipeline,
        sink: Arc<RecordingSink>,
        transport: Arc<RecordingTransport>,
        completer: Arc<EchoCompleter>,
        history: Arc<HistoryStore>,
    }

    fn fixture() -> Fixture {
        let sink = Arc::new(RecordingSink::default());
        let transport = Arc::new(RecordingTransport::default());
        let completer = Arc::new(EchoCompleter {
            seen_history: Mutex::new(Vec::new()),
        });
        let history = Arc::new(HistoryStore::new(Arc::new(MemoryTurnStorage::new()), 10));
        let pipeline = MessagePipeline::new(
            &PipelineConfig::default(),
            Arc::new(Limiter::new(2)),
            Arc::clone(&history),
            completer.clone(),
            transport.clone(),
            sink.clone(),
        );
        Fixture {
            pipeline,
            sink,
            transport,
            completer,
            history,
        }
    }

    #[test]
    fn commands_match_trimmed_and_case_insensitive() {
        let commands = CommandSet::default();
        assert_eq!(commands.parse("  /AI On "), Some(Command::EnableAi));
        assert_eq!(commands.parse("/ai off"), Some(Command::DisableAi));
        assert_eq!(commands.parse("/ai offline"), None);
        assert_eq!(commands.parse("please /ai off"), None);
    }

    #[tokio::test]
    async fn own_and_non_text_messages_are_observed_then_dropped() {
        let f = fixture();

        let mut own = InboundMessage::text("m1", "chat", "hi");
        own.from_self = true;
        let mut image = InboundMessage::text("m2", "chat", "caption");
        image.kind = MessageKind::Other("image".into());
        let blank = InboundMessage::text("m3", "chat", "   ");

        for msg in [own, image, blank] {
            assert!(matches!(f.pipeline.handle_inbound(msg).await, Dispatch::Dropped));
        }
        assert_eq!(f.sink.kinds(), vec!["message", "message", "message"]);
        assert!(f.transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn successful_reply_updates_history_and_quotes_original() {
        let f = fixture();

        match f
            .pipeline
            .handle_inbound(InboundMessage::text("m1", "chat", "hello"))
            .await
        {
            Dispatch::Queued(handle) => handle.await.unwrap().unwrap(),
            other => panic!("expected queued, got {other:?}"),
        }

        match f
            .pipeline
            .handle_inbound(InboundMessage::text("m2", "chat", "again"))
            .await
        {
            Dispatch::Queued(handle) => handle.await.unwrap().unwrap(),
            other => panic!("expected queued, got {other:?}"),
        }

        // Prior turns only: none for the first message, one exchange for the second.
        assert_eq!(*f.completer.seen_history.lock(), vec![0, 2]);
        assert_eq!(
            f.history.load("chat").await,
            vec![
                Turn::user("hello"),
                Turn::assistant("echo: hello"),
                Turn::user("again"),
                Turn::assistant("echo: again"),
            ]
        );

        let sent = f.transport.sent.lock();
        assert_eq!(sent[1].text, "echo: again");
        assert_eq!(sent[1].quoted_message_id.as_deref(), Some("m2"));
        assert_eq!(f.sink.kinds(), vec!["message", "message", "message", "message"]);
    }

    #[tokio::test]
    async fn toggle_api_flips_and_announces() {
        let f = fixture();
        assert!(f.pipeline.ai_enabled());
        assert!(!f.pipeline.toggle_ai());
        assert!(f.pipeline.toggle_ai());
        assert!(!f.pipeline.set_ai_enabled(false));
        assert_eq!(f.sink.kinds(), vec!["toggle", "toggle", "toggle"]);
    }

    #[tokio::test]
    async fn enable_command_turns_replies_back_on() {
        let f = fixture();
        f.pipeline.set_ai_enabled(false);

        let dispatch = f
            .pipeline
            .handle_inbound(InboundMessage::text("m1", "chat", "/AI ON"))
            .await;
        assert!(matches!(dispatch, Dispatch::Command { enabled: true }));
        assert!(f.pipeline.ai_enabled());
        assert_eq!(f.transport.sent.lock()[0].text, "✅ AI responses are now *ENABLED*");
    }
}
