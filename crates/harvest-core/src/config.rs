use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (harvest.toml + HARVEST_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HarvestConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Shell-command scripts registered at daemon startup.
    #[serde(default, rename = "script")]
    pub scripts: Vec<ScriptConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Run one immediate fire for tasks whose persisted next fire was missed
    /// while the process was down. Default is to skip missed fires.
    #[serde(default)]
    pub startup_catchup: bool,
    /// Upper bound on scripts running at the same time across all tasks.
    /// 0 disables the cap.
    #[serde(default)]
    pub max_concurrent_runs: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            startup_catchup: false,
            max_concurrent_runs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First-retry delay in seconds; doubles on every further retry.
    #[serde(default = "default_retry_base")]
    pub base_secs: u64,
    /// Ceiling for the backoff curve in seconds.
    #[serde(default = "default_retry_cap")]
    pub cap_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: default_retry_base(),
            cap_secs: default_retry_cap(),
        }
    }
}

/// One `[[script]]` entry — a shell command exposed to tasks as a script id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Identifier tasks reference via `script_id`.
    pub id: String,
    /// Command line passed to `sh -c`.
    pub command: String,
    /// Working directory for the child process.
    pub workdir: Option<String>,
    /// Deadline applied when the task itself sets no timeout.
    pub default_timeout_secs: Option<u64>,
}

fn default_retry_base() -> u64 {
    60
}
fn default_retry_cap() -> u64 {
    3600
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.harvest/harvest.db", home)
}

impl HarvestConfig {
    /// Load config from a TOML file with HARVEST_* env var overrides.
    ///
    /// Checks the explicit path argument first, then `~/.harvest/harvest.toml`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: HarvestConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HARVEST_").split("_"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.harvest/harvest.toml", home)
}
