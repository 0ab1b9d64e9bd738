use anyhow::{Context, Result};
use directories::UserDirs;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Environment variable that relocates the config directory.
pub const CONFIG_DIR_ENV: &str = "CLAWBRIDGE_CONFIG_DIR";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level clawbridge configuration, loaded from `config.toml`.
///
/// Resolution order: `--config-dir` flag → `CLAWBRIDGE_CONFIG_DIR` env → `~/.clawbridge/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct Config {
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// HTTP gateway configuration (`[gateway]`).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// OpenClaw bridge configuration (`[bridge]`).
    #[serde(default)]
    pub bridge: BridgeConfig,
}

// ── Gateway ───────────────────────────────────────────────────────

/// HTTP gateway configuration (`[gateway]` section).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GatewayConfig {
    /// Gateway port (default: 18794)
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Gateway host (default: 127.0.0.1)
    #[serde(default = "default_gateway_host")]
    pub host: String,
}

fn default_gateway_port() -> u16 {
    18794
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            host: default_gateway_host(),
        }
    }
}

// ── Bridge ────────────────────────────────────────────────────────

/// OpenClaw bridge configuration (`[bridge]` section).
///
/// Controls how the `openclaw` CLI is invoked and how the correlation
/// coordinator polls the shared conversation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BridgeConfig {
    /// Path to the `openclaw` binary.
    #[serde(default = "default_openclaw_bin")]
    pub openclaw_bin: String,
    /// Working directory for `openclaw` invocations. Inherited when unset.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// `PATH` passed to `openclaw` invocations. Inherited when empty.
    #[serde(default = "default_path_env")]
    pub path_env: String,
    /// Session used when the caller does not name one (fixed-session mode).
    #[serde(default = "default_session_key")]
    pub default_session_key: String,
    /// Language used for explanations when the caller does not name one.
    #[serde(default = "default_language")]
    pub default_language: String,
    /// Overall deadline for one explain call.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Delay before each history fetch.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum number of history fetches per explain call.
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
    /// Number of recent messages fetched per poll.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    /// Upper bound for a single `openclaw` invocation.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Upper bound for the detached session abort.
    #[serde(default = "default_abort_timeout_secs")]
    pub abort_timeout_secs: u64,
}

fn default_openclaw_bin() -> String {
    "/opt/homebrew/bin/openclaw".into()
}

fn default_path_env() -> String {
    "/opt/homebrew/bin:/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin".into()
}

fn default_session_key() -> String {
    "ext-transcript".into()
}

fn default_language() -> String {
    "en".into()
}

fn default_request_timeout_secs() -> u64 {
    70
}

fn default_poll_interval_ms() -> u64 {
    1200
}

fn default_poll_attempts() -> u32 {
    12
}

fn default_history_limit() -> usize {
    8
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_abort_timeout_secs() -> u64 {
    5
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            openclaw_bin: default_openclaw_bin(),
            working_dir: None,
            path_env: default_path_env(),
            default_session_key: default_session_key(),
            default_language: default_language(),
            request_timeout_secs: default_request_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_attempts: default_poll_attempts(),
            history_limit: default_history_limit(),
            call_timeout_secs: default_call_timeout_secs(),
            abort_timeout_secs: default_abort_timeout_secs(),
        }
    }
}

impl BridgeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn abort_timeout(&self) -> Duration {
        Duration::from_secs(self.abort_timeout_secs.max(1))
    }
}

// ── Loading ───────────────────────────────────────────────────────

fn default_config_dir() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".clawbridge"))
}

fn resolve_config_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        let dir = dir.trim();
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    default_config_dir()
}

fn non_empty_env(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

impl Config {
    /// Load `config.toml` from the resolved config directory, writing a
    /// default file on first run.
    pub async fn load_or_init(override_dir: Option<&Path>) -> Result<Self> {
        let config_dir = resolve_config_dir(override_dir)?;
        let config_path = config_dir.join("config.toml");

        fs::create_dir_all(&config_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let initialized = !config_path.exists();
        let mut config = if initialized {
            let mut config = Config::default();
            config.config_path = config_path.clone();
            config.save().await?;
            config
        } else {
            let contents = fs::read_to_string(&config_path)
                .await
                .context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path.clone();
            config
        };

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            initialized,
            "Config loaded"
        );
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        if self.gateway.host.trim().is_empty() {
            anyhow::bail!("gateway.host must not be empty");
        }
        if self.bridge.openclaw_bin.trim().is_empty() {
            anyhow::bail!("bridge.openclaw_bin must not be empty");
        }
        if self.bridge.default_session_key.trim().is_empty() {
            anyhow::bail!("bridge.default_session_key must not be empty");
        }
        if self.bridge.request_timeout_secs == 0 {
            anyhow::bail!("bridge.request_timeout_secs must be greater than 0");
        }
        if self.bridge.poll_interval_ms == 0 {
            anyhow::bail!("bridge.poll_interval_ms must be greater than 0");
        }
        if self.bridge.poll_attempts == 0 {
            anyhow::bail!("bridge.poll_attempts must be greater than 0");
        }
        if self.bridge.history_limit == 0 {
            anyhow::bail!("bridge.history_limit must be greater than 0");
        }
        Ok(())
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = non_empty_env(&["CLAWBRIDGE_HOST"]) {
            self.gateway.host = host;
        }

        // Port: CLAWBRIDGE_PORT or PORT
        if let Some(port) = non_empty_env(&["CLAWBRIDGE_PORT", "PORT"]) {
            match port.parse::<u16>() {
                Ok(port) => self.gateway.port = port,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid port override"),
            }
        }

        // Default session: CLAWBRIDGE_SESSION_KEY or SESSION_KEY
        if let Some(session) = non_empty_env(&["CLAWBRIDGE_SESSION_KEY", "SESSION_KEY"]) {
            self.bridge.default_session_key = session;
        }

        // Binary: CLAWBRIDGE_OPENCLAW_BIN or OPENCLAW_BIN
        if let Some(bin) = non_empty_env(&["CLAWBRIDGE_OPENCLAW_BIN", "OPENCLAW_BIN"]) {
            self.bridge.openclaw_bin = bin;
        }

        if let Some(dir) = non_empty_env(&["CLAWBRIDGE_OPENCLAW_WORKDIR"]) {
            self.bridge.working_dir = Some(PathBuf::from(dir));
        }
    }

    /// Persist the config as TOML, writing through a temp file so a crash
    /// never leaves a half-written config behind.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let temp_path = parent_dir.join(format!(".config.toml.tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&temp_path, toml_str)
            .await
            .with_context(|| format!("Failed to write temp config: {}", temp_path.display()))?;

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e).context("Failed to replace config file");
        }

        #[cfg(unix)]
        {
            use std::{fs::Permissions, os::unix::fs::PermissionsExt};
            let _ = fs::set_permissions(&self.config_path, Permissions::from_mode(0o600)).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_bridge_constants() {
        let config = Config::default();
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.port, 18794);
        assert_eq!(config.bridge.default_session_key, "ext-transcript");
        assert_eq!(config.bridge.request_timeout(), Duration::from_secs(70));
        assert_eq!(config.bridge.poll_interval(), Duration::from_millis(1200));
        assert_eq!(config.bridge.poll_attempts, 12);
        assert_eq!(config.bridge.history_limit, 8);
        assert_eq!(config.bridge.abort_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
[bridge]
openclaw_bin = "/usr/local/bin/openclaw"
poll_attempts = 3
"#,
        )
        .unwrap();
        assert_eq!(config.bridge.openclaw_bin, "/usr/local/bin/openclaw");
        assert_eq!(config.bridge.poll_attempts, 3);
        assert_eq!(config.bridge.history_limit, 8);
        assert_eq!(config.gateway.port, 18794);
    }

    #[test]
    fn validate_rejects_zero_poll_attempts() {
        let mut config = Config::default();
        config.bridge.poll_attempts = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("poll_attempts"));
    }

    #[test]
    fn validate_rejects_blank_session() {
        let mut config = Config::default();
        config.bridge.default_session_key = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn call_timeouts_never_zero() {
        let mut config = Config::default();
        config.bridge.call_timeout_secs = 0;
        config.bridge.abort_timeout_secs = 0;
        assert_eq!(config.bridge.call_timeout(), Duration::from_secs(1));
        assert_eq!(config.bridge.abort_timeout(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn load_or_init_writes_defaults_then_reads_them_back() {
        let tmp = TempDir::new().unwrap();
        let first = Config::load_or_init(Some(tmp.path())).await.unwrap();
        assert!(tmp.path().join("config.toml").exists());

        let mut edited = first.clone();
        edited.bridge.poll_attempts = 4;
        edited.save().await.unwrap();

        let second = Config::load_or_init(Some(tmp.path())).await.unwrap();
        assert_eq!(second.bridge.poll_attempts, 4);
        assert_eq!(second.config_path, tmp.path().join("config.toml"));
    }

    #[tokio::test]
    async fn load_or_init_reports_parse_errors() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "[bridge\nbroken")
            .await
            .unwrap();
        let err = Config::load_or_init(Some(tmp.path())).await.unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }
}
