use super::state::ConnectionState;
use super::supervisor::ConnectionSupervisor;
use super::traits::HealthCode;
use crate::health;
use std::sync::Arc;
use std::time::Duration;

const HEALTH_COMPONENT: &str = "session_monitor";

/// What one monitor cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Nothing to recover.
    Healthy(ConnectionState),
    /// The connection reports itself usable even though the state says otherwise.
    ConnectionAlive(ConnectionState),
    /// A restart was attempted; carries the state it ended in.
    Recovered(ConnectionState),
}

/// Periodic watchdog that restarts a dropped or failed connection.
pub struct SessionMonitor {
    supervisor: Arc<ConnectionSupervisor>,
}

impl SessionMonitor {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { supervisor }
    }

    /// One health check.
    ///
    /// Recovers when the supervisor sits in `DISCONNECTED` or `ERROR` and the
    /// connection is either gone or reports anything but connected.
    pub async fn check_once(&self) -> anyhow::Result<CheckOutcome> {
        let (state, _) = self.supervisor.current_state();
        if !state.is_recoverable() {
            return Ok(CheckOutcome::Healthy(state));
        }

        let health = self.supervisor.connection_health().await;
        if let Some(outcome) = classify_health(state, health.as_ref()) {
            return Ok(outcome);
        }

        // restart() re-checks the state under the supervisor's lock, so an
        // explicit start that landed since the read above is left alone.
        tracing::info!("Attempting to recover the session");
        let recovered = self.supervisor.restart().await?;
        Ok(CheckOutcome::Recovered(recovered))
    }

    /// Run checks every `interval` until the task is aborted. The first check
    /// happens one interval after the call. A failed or panicking cycle is
    /// logged and the loop carries on.
    pub async fn run_forever(self: Arc<Self>, interval: Duration) {
        let period = interval.max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        health::mark_component_ok(HEALTH_COMPONENT);
        tracing::info!("Session monitor running every {}s", period.as_secs());

        loop {
            ticker.tick().await;
            let monitor = Arc::clone(&self);
            match tokio::spawn(async move { monitor.check_once().await }).await {
                Ok(Ok(outcome)) => {
                    tracing::debug!(?outcome, "Session check complete");
                    health::mark_component_ok(HEALTH_COMPONENT);
                }
                Ok(Err(e)) => {
                    tracing::error!("Session check failed: {e:#}");
                    health::mark_component_error(HEALTH_COMPONENT, format!("{e:#}"));
                }
                Err(e) => {
                    tracing::error!("Session check panicked: {e}");
                    health::mark_component_error(HEALTH_COMPONENT, e);
                }
            }
        }
    }
}

/// `Some` when the health check shows a usable connection and recovery must be
/// skipped; `None` when the session should be restarted.
fn classify_health(
    state: ConnectionState,
    health: Option<&anyhow::Result<HealthCode>>,
) -> Option<CheckOutcome> {
    match health {
        Some(Ok(code)) if code.is_connected() => {
            tracing::debug!(%state, "Connection reports CONNECTED; leaving it alone");
            Some(CheckOutcome::ConnectionAlive(state))
        }
        Some(Ok(code)) => {
            tracing::info!(%state, health = %code, "Connection unhealthy");
            None
        }
        Some(Err(e)) => {
            tracing::warn!(%state, "Health check failed: {e:#}");
            None
        }
        None => {
            tracing::info!(%state, "No live connection");
            None
        }
    }
}
