use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Starting,
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub updated_at: String,
    pub last_ok: Option<String>,
    pub last_error: Option<String>,
    pub restart_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub pid: u32,
    pub updated_at: String,
    pub uptime_seconds: u64,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Per-component health for the daemon's long-running parts
/// (`connection`, `gateway`, `session_monitor`, `inbound`).
pub struct HealthRegistry {
    started_at: Instant,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            components: Mutex::new(BTreeMap::new()),
        }
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert<F>(&self, component: &str, update: F)
    where
        F: FnOnce(&mut ComponentHealth),
    {
        let mut map = self.components.lock();
        let now = now_rfc3339();
        let entry = map
            .entry(component.to_string())
            .or_insert_with(|| ComponentHealth {
                status: ComponentStatus::Starting,
                updated_at: now.clone(),
                last_ok: None,
                last_error: None,
                restart_count: 0,
            });
        update(entry);
        entry.updated_at = now;
    }

    pub fn mark_ok(&self, component: &str) {
        self.upsert(component, |entry| {
            entry.status = ComponentStatus::Ok;
            entry.last_ok = Some(now_rfc3339());
            entry.last_error = None;
        });
    }

    #[allow(clippy::needless_pass_by_value)]
    pub fn mark_error(&self, component: &str, error: impl ToString) {
        let err = error.to_string();
        self.upsert(component, move |entry| {
            entry.status = ComponentStatus::Error;
            entry.last_error = Some(err);
        });
    }

    pub fn bump_restart(&self, component: &str) {
        self.upsert(component, |entry| {
            entry.restart_count = entry.restart_count.saturating_add(1);
        });
    }

    pub fn component(&self, component: &str) -> Option<ComponentHealth> {
        self.components.lock().get(component).cloned()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            pid: std::process::id(),
            updated_at: now_rfc3339(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            components: self.components.lock().clone(),
        }
    }

    pub fn snapshot_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| {
            serde_json::json!({
                "status": "error",
                "message": "failed to serialize health snapshot"
            })
        })
    }
}

static REGISTRY: OnceLock<HealthRegistry> = OnceLock::new();

/// Process-wide registry shared by the daemon's components.
pub fn registry() -> &'static HealthRegistry {
    REGISTRY.get_or_init(HealthRegistry::new)
}

pub fn mark_component_ok(component: &str) {
    registry().mark_ok(component);
}

pub fn mark_component_error(component: &str, error: impl ToString) {
    registry().mark_error(component, error);
}

pub fn bump_component_restart(component: &str) {
    registry().bump_restart(component);
}

pub fn snapshot_json() -> serde_json::Value {
    registry().snapshot_json()
}
