pub mod console;
pub mod monitor;
pub mod state;
pub mod supervisor;
pub mod traits;

pub use console::{CONSOLE_CHAT_ID, ConsoleConnection, ConsoleConnectionFactory};
pub use monitor::{CheckOutcome, SessionMonitor};
pub use state::ConnectionState;
pub use supervisor::{ConnectionSupervisor, SupervisorError, SupervisorSnapshot};
pub use traits::{ConnectionEvent, ConnectionFactory, ConnectionHandle, HealthCode, LostReason};

use std::sync::Arc;

/// Connection factory for a configured `connection.kind`.
pub fn create_factory(kind: &str) -> anyhow::Result<Arc<dyn ConnectionFactory>> {
    match kind.trim().to_ascii_lowercase().as_str() {
        "console" | "cli" => Ok(Arc::new(ConsoleConnectionFactory)),
        other => anyhow::bail!(
            "unknown connection kind '{other}'; built-in kinds: console. \
             Other clients are wired in through ConnectionSupervisor::new"
        ),
    }
}
