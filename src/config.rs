use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the orchestrator
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Managed root: one subdirectory per deployable version
    pub path: PathBuf,

    /// Port the admin control API binds to on loopback (default: 8081)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Reverse-proxy identity and config-file locations
    pub proxy: ProxyConfig,

    /// Range of ports handed out to version workers
    pub port_range: PortRange,

    /// Worker launch settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Crash-loop respawn policy
    #[serde(default)]
    pub respawn: RespawnConfig,
}

/// Identity of the nginx server block plus where its config files live
#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Address the proxy server block listens on (default: 0.0.0.0)
    #[serde(default = "default_proxy_ip")]
    pub ip: String,

    /// Port the proxy server block listens on (default: 80)
    #[serde(default = "default_proxy_port")]
    pub port: u16,

    /// Application name; names the generated server config and its subdirectory
    pub name: String,

    /// Directory the server-level config is written to (e.g. /etc/nginx/conf.d)
    pub conf_dir: PathBuf,

    /// Directory for per-version location configs (default: <conf_dir>/<name>-apps)
    pub app_conf_dir: Option<PathBuf>,

    /// Directory with template overrides; built-in templates are used when
    /// unset or when a template file is missing
    pub template_dir: Option<PathBuf>,

    /// Command run to make the proxy pick up regenerated config
    #[serde(default = "default_reload_command")]
    pub reload_command: String,
}

impl ProxyConfig {
    pub fn app_conf_dir(&self) -> PathBuf {
        self.app_conf_dir
            .clone()
            .unwrap_or_else(|| self.conf_dir.join(format!("{}-apps", self.name)))
    }
}

/// Inclusive port range workers are allocated from
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Command line launched inside each version directory (default: "sh run.sh")
    #[serde(default = "default_worker_command")]
    pub command: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RespawnConfig {
    /// Delay before respawning a crashed worker, in seconds
    #[serde(default = "default_respawn_interval")]
    pub interval_secs: u64,

    /// Number of exits within the rolling window before the penalty delay kicks in
    #[serde(default = "default_respawn_limit")]
    pub limit: u32,

    /// Penalty delay once the crash-loop limit is exceeded, in seconds
    #[serde(default = "default_respawn_limit_interval")]
    pub limit_interval_secs: u64,

    /// Quiet period with no exits after which the crash counter resets, in seconds
    #[serde(default = "default_respawn_reset_after")]
    pub reset_after_secs: u64,
}

impl RespawnConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn limit_interval(&self) -> Duration {
        Duration::from_secs(self.limit_interval_secs)
    }

    pub fn reset_after(&self) -> Duration {
        Duration::from_secs(self.reset_after_secs)
    }
}

impl Default for RespawnConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_respawn_interval(),
            limit: default_respawn_limit(),
            limit_interval_secs: default_respawn_limit_interval(),
            reset_after_secs: default_respawn_reset_after(),
        }
    }
}

fn default_admin_port() -> u16 {
    8081
}

fn default_proxy_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    80
}

fn default_reload_command() -> String {
    "nginx -s reload".to_string()
}

fn default_worker_command() -> String {
    "sh run.sh".to_string()
}

fn default_respawn_interval() -> u64 {
    1
}

fn default_respawn_limit() -> u32 {
    3
}

fn default_respawn_limit_interval() -> u64 {
    30
}

fn default_respawn_reset_after() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.proxy.name.is_empty() {
            errors.push("proxy.name must not be empty".to_string());
        }
        if self.port_range.min > self.port_range.max {
            errors.push(format!(
                "port_range.min ({}) exceeds port_range.max ({})",
                self.port_range.min, self.port_range.max
            ));
        }
        match shell_words::split(&self.worker.command) {
            Ok(argv) if argv.is_empty() => {
                errors.push("worker.command must not be empty".to_string());
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("worker.command does not parse: {}", e)),
        }
        if self.respawn.limit == 0 {
            errors.push("respawn.limit must be at least 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
