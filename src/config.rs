use crate::elevation::ElevationMethod;
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Rule store file, defaults to `<data_dir>/rules.json`
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Append every mutating operation to `<state_dir>/audit.log`
    #[serde(default = "default_true")]
    pub audit_log: bool,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            audit_log: true,
            enforcement: EnforcementConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolved rule store location
    pub fn store_path(&self) -> Option<PathBuf> {
        self.store_path
            .clone()
            .or_else(|| get_data_dir().map(|d| d.join("rules.json")))
    }
}

/// A packet filter binary plus arguments placed before every invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

/// Where and how rules are enforced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnforcementConfig {
    /// `false` selects the no-op adapter (declared-only access control)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Pre-translation table, so ports are matched before Docker's DNAT
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_chain")]
    pub chain: String,
    #[serde(default = "default_ipv4_command")]
    pub ipv4_command: CommandSpec,
    #[serde(default = "default_ipv6_command")]
    pub ipv6_command: CommandSpec,
    /// Pass `-w` so concurrent xtables users queue instead of failing
    #[serde(default = "default_true")]
    pub wait_for_lock: bool,
    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,
    #[serde(default)]
    pub elevation: ElevationMethod,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            table: default_table(),
            chain: default_chain(),
            ipv4_command: default_ipv4_command(),
            ipv6_command: default_ipv6_command(),
            wait_for_lock: true,
            check_timeout_secs: default_check_timeout(),
            apply_timeout_secs: default_apply_timeout(),
            elevation: ElevationMethod::default(),
        }
    }
}

impl EnforcementConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs.max(1))
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs.max(1))
    }
}

fn default_true() -> bool {
    true
}

fn default_table() -> String {
    "raw".to_string()
}

fn default_chain() -> String {
    "PREROUTING".to_string()
}

fn default_ipv4_command() -> CommandSpec {
    CommandSpec::new("iptables")
}

fn default_ipv6_command() -> CommandSpec {
    CommandSpec::new("ip6tables")
}

fn default_check_timeout() -> u64 {
    5
}

fn default_apply_timeout() -> u64 {
    10
}

/// Default config location, `<data_dir>/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    get_data_dir().map(|d| d.join("config.json"))
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut temp_path = path.to_path_buf();
    temp_path.set_extension("json.tmp");

    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        tokio::fs::write(&temp_path, json.as_bytes()).await?;
    }

    tokio::fs::rename(temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the config from `path` (or the default location), falling back to
/// defaults when the file is missing or unreadable.
pub async fn load_config(path: Option<&Path>) -> AppConfig {
    let path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => default_config_path(),
    };

    if let Some(path) = path
        && let Ok(json) = tokio::fs::read_to_string(&path).await
    {
        match serde_json::from_str::<AppConfig>(&json) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("Ignoring invalid config {}: {e}", path.display());
            }
        }
    }
    AppConfig::default()
}
