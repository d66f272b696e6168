use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Identifier handed to the connection factory for session persistence.
    #[serde(default = "default_session_name")]
    pub session_name: String,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub limiter: LimiterConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

fn default_session_name() -> String {
    "api-whatsapp-bot-session".into()
}

// ── Provider ─────────────────────────────────────────────────────

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`. `/chat/completions` is appended.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Omitted from the request when unset, leaving the backend default.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Per-request HTTP timeout. Bounds how long one call can hold a limiter slot.
    #[serde(default = "default_provider_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra attempts for retryable failures (network, 408, 429, 5xx).
    #[serde(default)]
    pub retries: u32,
    /// Base backoff (ms) between retries, doubled per attempt.
    #[serde(default = "default_provider_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_model() -> String {
    "provider-2/gpt-4o".into()
}

fn default_provider_timeout_secs() -> u64 {
    120
}

fn default_provider_backoff_ms() -> u64 {
    500
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: default_model(),
            temperature: None,
            timeout_secs: default_provider_timeout_secs(),
            retries: 0,
            backoff_ms: default_provider_backoff_ms(),
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Control command that turns model replies on (matched trimmed, case-insensitive).
    #[serde(default = "default_enable_command")]
    pub enable_command: String,
    /// Control command that turns model replies off.
    #[serde(default = "default_disable_command")]
    pub disable_command: String,
    #[serde(default = "default_enabled_reply")]
    pub enabled_reply: String,
    #[serde(default = "default_disabled_reply")]
    pub disabled_reply: String,
}

fn default_system_prompt() -> String {
    "You are a friendly WhatsApp assistant. Remember previous parts of the conversation. \
     Keep responses concise."
        .into()
}

fn default_enable_command() -> String {
    "/ai on".into()
}

fn default_disable_command() -> String {
    "/ai off".into()
}

fn default_enabled_reply() -> String {
    "✅ AI responses are now *ENABLED*".into()
}

fn default_disabled_reply() -> String {
    "❌ AI responses are now *DISABLED*".into()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            enable_command: default_enable_command(),
            disable_command: default_disable_command(),
            enabled_reply: default_enabled_reply(),
            disabled_reply: default_disabled_reply(),
        }
    }
}

// ── History ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Window `W`: turns kept per chat, oldest dropped first.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,
    /// Defaults to `<workspace>/conversation_history`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_max_turns() -> usize {
    10
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            dir: None,
        }
    }
}

// ── Limiter ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Model calls allowed in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    crate::concurrency::DEFAULT_MAX_CONCURRENT_COMPLETIONS
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

// ── Session monitor ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between connection health polls.
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
}

fn default_monitor_interval_secs() -> u64 {
    300
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
        }
    }
}

// ── Connection ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Built-in connection factory to use. Only `console` ships with the binary;
    /// other messaging clients are injected through the library API.
    #[serde(default = "default_connection_kind")]
    pub kind: String,
    /// Start the connection as soon as the daemon boots.
    #[serde(default = "default_true")]
    pub autostart: bool,
}

fn default_connection_kind() -> String {
    "console".into()
}

fn default_true() -> bool {
    true
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            kind: default_connection_kind(),
            autostart: true,
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway port (default: 3001)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
    /// Directory holding the dashboard's static files. Not served when unset.
    #[serde(default)]
    pub web_dir: Option<PathBuf>,
    /// How long shutdown waits for the connection to close.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_gateway_port() -> u16 {
    3001
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_shutdown_grace_secs() -> u64 {
    15
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
            web_dir: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

// ── Reliability / supervision ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Initial backoff for daemon component restarts.
    #[serde(default = "default_component_backoff_secs")]
    pub component_initial_backoff_secs: u64,
    /// Max backoff for daemon component restarts.
    #[serde(default = "default_component_backoff_max_secs")]
    pub component_max_backoff_secs: u64,
}

fn default_component_backoff_secs() -> u64 {
    2
}

fn default_component_backoff_max_secs() -> u64 {
    60
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            component_initial_backoff_secs: default_component_backoff_secs(),
            component_max_backoff_secs: default_component_backoff_max_secs(),
        }
    }
}

// ── Config impl ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home =
            UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        Self::rooted_at(&home.join(".chatrelay"))
    }
}

impl Config {
    /// Default config whose computed paths live under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            workspace_dir: root.join("workspace"),
            config_path: root.join("config.toml"),
            session_name: default_session_name(),
            provider: ProviderConfig::default(),
            pipeline: PipelineConfig::default(),
            history: HistoryConfig::default(),
            limiter: LimiterConfig::default(),
            monitor: MonitorConfig::default(),
            connection: ConnectionConfig::default(),
            gateway: GatewayConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }

    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let mut config = Self::load_or_init_in(&home.join(".chatrelay"))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `<root>/config.toml`, writing defaults there first if it is missing.
    /// Environment overrides are not applied.
    pub fn load_or_init_in(root: &Path) -> Result<Self> {
        let config_path = root.join("config.toml");

        if !root.exists() {
            fs::create_dir_all(root).context("Failed to create .chatrelay directory")?;
            fs::create_dir_all(root.join("workspace"))
                .context("Failed to create workspace directory")?;
        }

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config.workspace_dir = root.join("workspace");
            Ok(config)
        } else {
            let config = Self::rooted_at(root);
            config.save()?;
            Ok(config)
        }
    }

    /// Directory holding one JSON file per chat.
    pub fn history_dir(&self) -> PathBuf {
        self.history
            .dir
            .clone()
            .unwrap_or_else(|| self.workspace_dir.join("conversation_history"))
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. `CHATRELAY_*` names win over the
    /// legacy names the relay has always honoured.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |primary: &str, legacy: &str| {
            lookup(primary)
                .or_else(|| lookup(legacy))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(name) = get("CHATRELAY_SESSION_NAME", "SESSION_NAME") {
            self.session_name = name;
        }

        // Non-positive values are ignored so the limiter and the window stay positive.
        if let Some(limit) = get("CHATRELAY_CONCURRENCY", "CONCURRENCY_LIMIT_LLM")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            self.limiter.max_concurrent = limit;
        }

        if let Some(turns) = get("CHATRELAY_MAX_HISTORY", "MAX_CONVERSATION_HISTORY")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            self.history.max_turns = turns;
        }

        if let Some(port) =
            get("CHATRELAY_GATEWAY_PORT", "PORT").and_then(|v| v.parse::<u16>().ok())
        {
            self.gateway.port = port;
        }

        if let Some(host) = get("CHATRELAY_GATEWAY_HOST", "HOST") {
            self.gateway.host = host;
        }

        if let Some(key) = get("CHATRELAY_API_KEY", "GPT_API_KEY") {
            self.provider.api_key = Some(key);
        }

        if let Some(url) = get("CHATRELAY_BASE_URL", "GPT_BASE_URL") {
            self.provider.base_url = Some(url);
        }

        if let Some(model) = get("CHATRELAY_MODEL", "GPT_MODEL_NAME") {
            self.provider.model = model;
        }

        if let Some(secs) = get("CHATRELAY_MONITOR_INTERVAL_SECS", "SESSION_MONITOR_INTERVAL_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
        {
            self.monitor.interval_secs = secs;
        }
    }

    /// Copy safe to print: secrets replaced with a marker.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.provider.api_key.is_some() {
            copy.provider.api_key = Some("***".into());
        }
        copy
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("config.toml");
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path) {
            let _ = fs::remove_file(&temp_path);
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir)
    }
}

#[cfg(unix)]
fn sync_directory(path: &Path) -> Result<()> {
    let dir = File::open(path)
        .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
    dir.sync_all()
        .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── Defaults ─────────────────────────────────────────────

    #[test]
    fn config_default_has_sane_values() {
        let c = Config::rooted_at(Path::new("/tmp/relay"));
        assert_eq!(c.session_name, "api-whatsapp-bot-session");
        assert_eq!(c.limiter.max_concurrent, 2);
        assert_eq!(c.history.max_turns, 10);
        assert_eq!(c.monitor.interval_secs, 300);
        assert_eq!(c.gateway.port, 3001);
        assert_eq!(c.provider.model, "provider-2/gpt-4o");
        assert!(c.provider.api_key.is_none());
        assert_eq!(c.connection.kind, "console");
        assert_eq!(
            c.history_dir(),
            PathBuf::from("/tmp/relay/workspace/conversation_history")
        );
    }

    #[test]
    fn empty_toml_deserializes_to_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c.pipeline.enable_command, "/ai on");
        assert_eq!(c.pipeline.disable_command, "/ai off");
        assert_eq!(c.reliability.component_initial_backoff_secs, 2);
    }

    // ── Load / save ──────────────────────────────────────────

    #[test]
    fn load_or_init_writes_defaults_then_reads_them_back() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join(".chatrelay");

        let first = Config::load_or_init_in(&root).unwrap();
        assert!(first.config_path.exists());

        let mut edited = first.clone();
        edited.limiter.max_concurrent = 7;
        edited.provider.base_url = Some("https://llm.example/v1".into());
        edited.save().unwrap();

        let second = Config::load_or_init_in(&root).unwrap();
        assert_eq!(second.limiter.max_concurrent, 7);
        assert_eq!(
            second.provider.base_url.as_deref(),
            Some("https://llm.example/v1")
        );
        assert_eq!(second.workspace_dir, root.join("workspace"));
    }

    #[test]
    fn load_rejects_malformed_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("config.toml"), "limiter = [").unwrap();
        assert!(Config::load_or_init_in(tmp.path()).is_err());
    }

    // ── Env overrides ────────────────────────────────────────

    #[test]
    fn legacy_env_names_override_file_values() {
        let mut c = Config::rooted_at(Path::new("/tmp/relay"));
        c.apply_overrides_from(lookup(&[
            ("SESSION_NAME", "shop-bot"),
            ("CONCURRENCY_LIMIT_LLM", "4"),
            ("MAX_CONVERSATION_HISTORY", "20"),
            ("PORT", "8088"),
            ("GPT_API_KEY", "sk-test"),
            ("GPT_BASE_URL", "https://llm.example/v1"),
            ("GPT_MODEL_NAME", "gpt-4o-mini"),
        ]));
        assert_eq!(c.session_name, "shop-bot");
        assert_eq!(c.limiter.max_concurrent, 4);
        assert_eq!(c.history.max_turns, 20);
        assert_eq!(c.gateway.port, 8088);
        assert_eq!(c.provider.api_key.as_deref(), Some("sk-test"));
        assert_eq!(c.provider.model, "gpt-4o-mini");
    }

    #[test]
    fn prefixed_env_names_win_over_legacy() {
        let mut c = Config::rooted_at(Path::new("/tmp/relay"));
        c.apply_overrides_from(lookup(&[
            ("CHATRELAY_MODEL", "preferred"),
            ("GPT_MODEL_NAME", "legacy"),
        ]));
        assert_eq!(c.provider.model, "preferred");
    }

    #[test]
    fn non_positive_limits_are_ignored() {
        let mut c = Config::rooted_at(Path::new("/tmp/relay"));
        c.apply_overrides_from(lookup(&[
            ("CONCURRENCY_LIMIT_LLM", "0"),
            ("MAX_CONVERSATION_HISTORY", "abc"),
        ]));
        assert_eq!(c.limiter.max_concurrent, 2);
        assert_eq!(c.history.max_turns, 10);
    }

    #[test]
    fn redacted_hides_api_key() {
        let mut c = Config::rooted_at(Path::new("/tmp/relay"));
        c.provider.api_key = Some("sk-secret".into());
        let shown = toml::to_string(&c.redacted()).unwrap();
        assert!(!shown.contains("sk-secret"));
        assert!(shown.contains("***"));
    }
}
