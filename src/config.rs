use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway.
///
/// Loaded once at process start and immutable for the process lifetime.
///
/// # Precondition
///
/// Each worker class must be assigned a disjoint port range: with ports
/// computed as `base_port + index`, two classes whose ranges overlap can
/// collide on the same port. This is an invariant of the configuration file
/// and is not enforced at runtime.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Global default settings for worker classes
    #[serde(default)]
    pub defaults: ClassDefaults,

    /// Expired-record sweeping
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Worker class configurations, keyed by class name
    #[serde(default)]
    pub classes: HashMap<String, ClassConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
        }
    }
}

/// Sweeper settings
#[derive(Debug, Deserialize, Clone)]
pub struct CleanupConfig {
    /// Whether the periodic sweeper runs at all (default: true)
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,

    /// Sweep interval in seconds (default: 300)
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleanup_enabled(),
            interval_secs: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClassDefaults {
    /// Default time-to-live for a worker in seconds (default: 7200)
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Default startup timeout in seconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Default readiness poll interval in milliseconds
    #[serde(default = "default_startup_poll_interval")]
    pub startup_poll_interval_ms: u64,

    /// Default grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for ClassDefaults {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            startup_timeout_secs: default_startup_timeout(),
            startup_poll_interval_ms: default_startup_poll_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

/// Configuration for a single worker class.
///
/// # Security Warning
///
/// The `command` and `args` fields allow arbitrary command execution.
/// Configuration files must be protected with appropriate file permissions
/// (e.g., readable only by the service user).
#[derive(Debug, Deserialize, Clone)]
pub struct ClassConfig {
    /// Whether this class accepts requests (default: true)
    #[serde(default = "default_class_enabled")]
    pub enabled: bool,

    /// First port of this class's range; worker index N listens on base_port + N
    pub base_port: u16,

    /// Command to execute to start a worker of this class
    pub command: String,

    /// Arguments to pass to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to set for the worker process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the command
    pub working_dir: Option<String>,

    /// Time-to-live in seconds (overrides default)
    pub ttl_secs: Option<u64>,

    /// Startup timeout in seconds (overrides default)
    pub startup_timeout_secs: Option<u64>,

    /// Readiness poll interval in milliseconds (overrides default)
    pub startup_poll_interval_ms: Option<u64>,

    /// Grace period in seconds between SIGTERM and SIGKILL (overrides default)
    pub shutdown_grace_period_secs: Option<u64>,
}

impl ClassConfig {
    /// Create a new class config with defaults
    pub fn new(command: &str, base_port: u16) -> Self {
        Self {
            enabled: true,
            base_port,
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            ttl_secs: None,
            startup_timeout_secs: None,
            startup_poll_interval_ms: None,
            shutdown_grace_period_secs: None,
        }
    }

    /// Set arguments for this class (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn ttl(&self, defaults: &ClassDefaults) -> Duration {
        Duration::from_secs(self.ttl_secs.unwrap_or(defaults.ttl_secs))
    }

    pub fn startup_timeout(&self, defaults: &ClassDefaults) -> Duration {
        Duration::from_secs(
            self.startup_timeout_secs
                .unwrap_or(defaults.startup_timeout_secs),
        )
    }

    pub fn startup_poll_interval(&self, defaults: &ClassDefaults) -> Duration {
        Duration::from_millis(
            self.startup_poll_interval_ms
                .unwrap_or(defaults.startup_poll_interval_ms),
        )
    }

    pub fn shutdown_grace_period(&self, defaults: &ClassDefaults) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period_secs
                .unwrap_or(defaults.shutdown_grace_period_secs),
        )
    }

    /// Validate the class configuration
    pub fn validate(&self, class: &str) -> Result<(), String> {
        if self.command.is_empty() {
            return Err(format!("Class '{}': 'command' must not be empty", class));
        }

        if self.base_port == 0 {
            return Err(format!(
                "Class '{}': 'base_port' must be greater than 0",
                class
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_cleanup_interval() -> u64 {
    300 // 5 minutes
}

fn default_class_enabled() -> bool {
    true
}

fn default_ttl() -> u64 {
    7200 // 2 hours
}

fn default_startup_timeout() -> u64 {
    30 // 30 seconds
}

fn default_startup_poll_interval() -> u64 {
    100 // 100ms
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
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

        for (class, cfg) in &self.classes {
            if let Err(e) = cfg.validate(class) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
