use super::traits::{ConnectionEvent, ConnectionFactory, ConnectionHandle, HealthCode, LostReason};
use crate::pipeline::{InboundMessage, MessageKind, SenderMeta};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Chat id used for every console message.
pub const CONSOLE_CHAT_ID: &str = "console";

/// stdin/stdout connection, always available, zero setup. Each line typed is an
/// inbound message; replies are printed.
pub struct ConsoleConnectionFactory;

#[async_trait]
impl ConnectionFactory for ConsoleConnectionFactory {
    fn name(&self) -> &str {
        "console"
    }

    async fn create(
        &self,
        _session_id: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> anyhow::Result<Arc<dyn ConnectionHandle>> {
        let connection = ConsoleConnection::spawn(BufReader::new(io::stdin()), events);
        Ok(Arc::new(connection))
    }
}

pub struct ConsoleConnection {
    closed: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ConsoleConnection {
    /// Start reading lines from `input`. The connection reports ready at once.
    pub fn spawn<R>(input: R, events: mpsc::UnboundedSender<ConnectionEvent>) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let _ = events.send(ConnectionEvent::Ready);

        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            let mut lines = input.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" || line == "/exit" {
                    break;
                }

                let message = InboundMessage {
                    id: Uuid::new_v4().to_string(),
                    chat_id: CONSOLE_CHAT_ID.to_string(),
                    from_self: false,
                    kind: MessageKind::Chat,
                    body: line,
                    sender: SenderMeta {
                        id: "user".to_string(),
                        display_name: None,
                    },
                    is_group: false,
                    timestamp: chrono::Utc::now(),
                };
                if events.send(ConnectionEvent::Message(message)).is_err() {
                    return;
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
            let _ = events.send(ConnectionEvent::Lost(LostReason::Disconnected));
        });

        Self {
            closed,
            reader: parking_lot::Mutex::new(Some(reader)),
        }
    }
}

#[async_trait]
impl ConnectionHandle for ConsoleConnection {
    async fn send(&self, chat_id: &str, text: &str, _quoted_id: Option<&str>) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("console connection is closed");
        }
        if chat_id == CONSOLE_CHAT_ID {
            println!("{text}");
        } else {
            println!("[{chat_id}] {text}");
        }
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        Ok(())
    }

    async fn health(&self) -> anyhow::Result<HealthCode> {
        Ok(if self.closed.load(Ordering::SeqCst) {
            HealthCode::Disconnected
        } else {
            HealthCode::Connected
        })
    }
}
