//! End-to-end message flow through the pipeline: toggle handling, chat
//! commands, history windows, delivery failures and failure isolation
//! between concurrent completions.

use async_trait::async_trait;
use chatrelay::concurrency::Limiter;
use chatrelay::config::PipelineConfig;
use chatrelay::history::{HistoryStore, MemoryTurnStorage, Turn};
use chatrelay::pipeline::{
    Dispatch, InboundMessage, MessagePipeline, OutboundReply, PipelineError, ReplyTransport,
};
use chatrelay::providers::Completer;
use chatrelay::status_events::{ErrorPayload, StatusEvent, StatusSink};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

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

    fn clear(&self) {
        self.events.lock().clear();
    }
}

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<OutboundReply>>,
    offline: AtomicBool,
}

#[async_trait]
impl ReplyTransport for RecordingTransport {
    async fn send_reply(&self, reply: &OutboundReply) -> anyhow::Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("no active connection");
        }
        self.sent.lock().push(reply.clone());
        Ok(())
    }
}

/// Answers `re: <message>`, fails on "FAIL", and tracks how many calls overlap.
#[derive(Default)]
struct ScriptedCompleter {
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    delay_ms: u64,
    history_lens: Mutex<Vec<usize>>,
}

#[async_trait]
impl Completer for ScriptedCompleter {
    async fn complete(&self, _: &str, history: &[Turn], user: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.history_lens.lock().push(history.len());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        if user == "FAIL" {
            anyhow::bail!("model unavailable");
        }
        Ok(format!("re: {user}"))
    }
}

struct Harness {
    pipeline: MessagePipeline,
    history: Arc<HistoryStore>,
    completer: Arc<ScriptedCompleter>,
    transport: Arc<RecordingTransport>,
    sink: Arc<RecordingSink>,
}

fn harness(max_concurrent: usize, window: usize, completer: ScriptedCompleter) -> Harness {
    let history = Arc::new(HistoryStore::new(Arc::new(MemoryTurnStorage::new()), window));
    let completer = Arc::new(completer);
    let transport = Arc::new(RecordingTransport::default());
    let sink = Arc::new(RecordingSink::default());
    let pipeline = MessagePipeline::new(
        &PipelineConfig::default(),
        Arc::new(Limiter::new(max_concurrent)),
        history.clone(),
        completer.clone(),
        transport.clone(),
        sink.clone(),
    );
    Harness {
        pipeline,
        history,
        completer,
        transport,
        sink,
    }
}

async fn finish(dispatch: Dispatch) -> Result<(), PipelineError> {
    match dispatch {
        Dispatch::Queued(handle) => handle.await.expect("task ran to completion"),
        other => panic!("expected a queued completion, got {other:?}"),
    }
}

#[tokio::test]
async fn disabled_ai_only_reports_the_message() {
    let h = harness(2, 10, ScriptedCompleter::default());
    h.pipeline.set_ai_enabled(false);
    h.sink.clear();

    let dispatch = h
        .pipeline
        .handle_inbound(InboundMessage::text("m1", "alice@c.us", "hello"))
        .await;

    assert!(matches!(dispatch, Dispatch::Disabled));
    assert_eq!(h.completer.calls.load(Ordering::SeqCst), 0);
    assert!(h.transport.sent.lock().is_empty());
    assert_eq!(h.sink.kinds(), vec!["message"]);
    assert!(h.history.load("alice@c.us").await.is_empty());
}

#[tokio::test]
async fn chat_command_disables_and_confirms_with_a_quote() {
    let h = harness(2, 10, ScriptedCompleter::default());

    let dispatch = h
        .pipeline
        .handle_inbound(InboundMessage::text("cmd-1", "alice@c.us", "  /AI OFF "))
        .await;

    assert!(matches!(dispatch, Dispatch::Command { enabled: false }));
    assert!(!h.pipeline.ai_enabled());
    assert_eq!(h.completer.calls.load(Ordering::SeqCst), 0);

    let sent = h.transport.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].chat_id, "alice@c.us");
    assert_eq!(sent[0].quoted_message_id.as_deref(), Some("cmd-1"));
    assert!(sent[0].text.contains("DISABLED"));
    assert!(h.sink.kinds().contains(&"toggle"));

    // Commands still work while disabled.
    let dispatch = h
        .pipeline
        .handle_inbound(InboundMessage::text("cmd-2", "alice@c.us", "/ai on"))
        .await;
    assert!(matches!(dispatch, Dispatch::Command { enabled: true }));
    assert!(h.pipeline.ai_enabled());
}

#[tokio::test]
async fn failing_completion_does_not_affect_its_neighbour() {
    let h = harness(
        2,
        10,
        ScriptedCompleter {
            delay_ms: 20,
            ..ScriptedCompleter::default()
        },
    );

    let failing = h
        .pipeline
        .handle_inbound(InboundMessage::text("c", "carol@c.us", "FAIL"))
        .await;
    let succeeding = h
        .pipeline
        .handle_inbound(InboundMessage::text("d", "dave@c.us", "ping"))
        .await;

    let (failed, succeeded) = tokio::join!(finish(failing), finish(succeeding));
    assert!(matches!(failed, Err(PipelineError::Completion(ref m)) if m.contains("model unavailable")));
    assert!(succeeded.is_ok());

    let sent = h.transport.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].chat_id, "dave@c.us");
    assert_eq!(sent[0].text, "re: ping");
    assert_eq!(sent[0].quoted_message_id.as_deref(), Some("d"));

    assert!(h.history.load("carol@c.us").await.is_empty());
    assert_eq!(
        h.history.load("dave@c.us").await,
        vec![Turn::user("ping"), Turn::assistant("re: ping")]
    );
    assert!(h.sink.kinds().contains(&"error"));
}

#[tokio::test]
async fn each_completion_sees_the_windowed_history() {
    let h = harness(2, 4, ScriptedCompleter::default());

    for (i, body) in ["one", "two", "three"].into_iter().enumerate() {
        let dispatch = h
            .pipeline
            .handle_inbound(InboundMessage::text(format!("m{i}"), "bob@c.us", body))
            .await;
        finish(dispatch).await.unwrap();
    }

    assert_eq!(*h.completer.history_lens.lock(), vec![0, 2, 4]);
    assert_eq!(
        h.history.load("bob@c.us").await,
        vec![
            Turn::user("two"),
            Turn::assistant("re: two"),
            Turn::user("three"),
            Turn::assistant("re: three"),
        ]
    );
}

#[tokio::test]
async fn completions_never_exceed_the_limit() {
    let h = harness(
        2,
        10,
        ScriptedCompleter {
            delay_ms: 30,
            ..ScriptedCompleter::default()
        },
    );

    let mut dispatches = Vec::new();
    for i in 0..5 {
        dispatches.push(
            h.pipeline
                .handle_inbound(InboundMessage::text(format!("m{i}"), format!("chat{i}@c.us"), "hi"))
                .await,
        );
    }
    for dispatch in dispatches {
        finish(dispatch).await.unwrap();
    }

    assert_eq!(h.completer.calls.load(Ordering::SeqCst), 5);
    assert!(h.completer.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(h.transport.sent.lock().len(), 5);
}

#[tokio::test]
async fn own_and_non_text_messages_are_dropped() {
    let h = harness(2, 10, ScriptedCompleter::default());

    let mut own = InboundMessage::text("m1", "alice@c.us", "note to self");
    own.from_self = true;
    let mut sticker = InboundMessage::text("m2", "alice@c.us", "");
    sticker.kind = chatrelay::pipeline::MessageKind::parse("sticker");

    assert!(matches!(h.pipeline.handle_inbound(own).await, Dispatch::Dropped));
    assert!(matches!(h.pipeline.handle_inbound(sticker).await, Dispatch::Dropped));
    assert_eq!(h.completer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.sink.kinds(), vec!["message", "message"]);
}

#[tokio::test]
async fn undelivered_reply_is_reported_but_kept_in_history() {
    let h = harness(2, 10, ScriptedCompleter::default());
    h.transport.offline.store(true, Ordering::SeqCst);
    h.sink.clear();

    let dispatch = h
        .pipeline
        .handle_inbound(InboundMessage::text("m1", "erin@c.us", "are you there?"))
        .await;
    let result = finish(dispatch).await;

    assert!(matches!(result, Err(PipelineError::Send(ref m)) if m.contains("no active connection")));
    assert!(h.transport.sent.lock().is_empty());
    let errors: Vec<ErrorPayload> = h
        .sink
        .events
        .lock()
        .iter()
        .filter_map(|e| match e {
            StatusEvent::Error(payload) => Some(payload.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].chat_id.as_deref(), Some("erin@c.us"));
    assert_eq!(errors[0].message_id.as_deref(), Some("m1"));
    assert!(errors[0].message.starts_with("reply delivery failed"));
    assert_eq!(
        h.history.load("erin@c.us").await,
        vec![Turn::user("are you there?"), Turn::assistant("re: are you there?")]
    );
}
