use crate::pipeline::InboundMessage;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Health reported by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCode {
    Connected,
    Conflict,
    Opening,
    Unpaired,
    Disconnected,
    Unlaunched,
    Other(String),
}

impl HealthCode {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CONNECTED" => Self::Connected,
            "CONFLICT" => Self::Conflict,
            "OPENING" => Self::Opening,
            "UNPAIRED" | "UNPAIRED_IDLE" => Self::Unpaired,
            "DISCONNECTED" => Self::Disconnected,
            "UNLAUNCHED" => Self::Unlaunched,
            _ => Self::Other(raw.to_string()),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for HealthCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => f.write_str("CONNECTED"),
            Self::Conflict => f.write_str("CONFLICT"),
            Self::Opening => f.write_str("OPENING"),
            Self::Unpaired => f.write_str("UNPAIRED"),
            Self::Disconnected => f.write_str("DISCONNECTED"),
            Self::Unlaunched => f.write_str("UNLAUNCHED"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// Why a session went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LostReason {
    Unpaired,
    Disconnected,
    Unlaunched,
    BrowserClosed,
    Other(String),
}

impl LostReason {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "UNPAIRED" | "UNPAIRED_IDLE" => Self::Unpaired,
            "DISCONNECTED" => Self::Disconnected,
            "UNLAUNCHED" => Self::Unlaunched,
            "BROWSER_CLOSED" | "BROWSERCLOSE" | "BROWSER-CLOSED" => Self::BrowserClosed,
            _ => Self::Other(raw.to_string()),
        }
    }
}

impl fmt::Display for LostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unpaired => f.write_str("UNPAIRED"),
            Self::Disconnected => f.write_str("DISCONNECTED"),
            Self::Unlaunched => f.write_str("UNLAUNCHED"),
            Self::BrowserClosed => f.write_str("browser closed"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// Events a connection pushes to its supervisor.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Pairing data to show the user (e.g. QR code contents).
    AuthChallenge(String),
    Ready,
    Lost(LostReason),
    /// The session was opened elsewhere.
    Conflict,
    Message(InboundMessage),
}

/// A live connection to the messaging network.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    async fn send(&self, chat_id: &str, text: &str, quoted_id: Option<&str>) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;

    async fn health(&self) -> anyhow::Result<HealthCode>;

    /// Reclaim the session after a conflict.
    async fn take_over(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Opens connections. Events for the new connection go to `events` for as long
/// as the connection lives.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn name(&self) -> &str;

    async fn create(
        &self,
        session_id: &str,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> anyhow::Result<Arc<dyn ConnectionHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_code_parses_known_values_case_insensitively() {
        assert_eq!(HealthCode::parse("CONNECTED"), HealthCode::Connected);
        assert_eq!(HealthCode::parse("conflict"), HealthCode::Conflict);
        assert_eq!(HealthCode::parse(" UNPAIRED "), HealthCode::Unpaired);
        assert_eq!(
            HealthCode::parse("TIMEOUT"),
            HealthCode::Other("TIMEOUT".into())
        );
        assert!(!HealthCode::Opening.is_connected());
    }

    #[test]
    fn lost_reason_covers_browser_closed() {
        assert_eq!(
            LostReason::parse("browser_closed"),
            LostReason::BrowserClosed
        );
        assert_eq!(LostReason::parse("UNLAUNCHED"), LostReason::Unlaunched);
        assert_eq!(LostReason::Unpaired.to_string(), "UNPAIRED");
    }
}
