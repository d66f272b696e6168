use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the external messaging session.
///
/// `OFFLINE → INITIALIZING → [AWAITING_AUTH →] CONNECTED → DISCONNECTED | ERROR`,
/// then back to `INITIALIZING` through a restart or to `OFFLINE` through stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Offline,
    Initializing,
    AwaitingAuth,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offline => "OFFLINE",
            Self::Initializing => "INITIALIZING",
            Self::AwaitingAuth => "AWAITING_AUTH",
            Self::Connected => "CONNECTED",
            Self::Disconnected => "DISCONNECTED",
            Self::Error => "ERROR",
        }
    }

    /// An attempt is in flight or established; `start()` is a no-op here.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::AwaitingAuth | Self::Connected
        )
    }

    /// States the session monitor treats as recovery triggers.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }

    /// Pairing in progress: auth challenges and the ready event are accepted.
    pub fn is_pairing(self) -> bool {
        matches!(self, Self::Initializing | Self::AwaitingAuth)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{AwaitingAuth, Connected, Disconnected, Error, Initializing, Offline};

        if next == Offline {
            return true;
        }
        match self {
            Offline | Disconnected | Error => next == Initializing,
            Initializing => matches!(next, AwaitingAuth | Connected | Disconnected | Error),
            AwaitingAuth => matches!(next, AwaitingAuth | Connected | Disconnected | Error),
            Connected => next == Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
