use pitaya_core::{RestrictionConfig, DEFAULT_RESTRICTION_TARGETS, DEFAULT_WATCH_LIST};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides, e.g.
/// `PITAYA__ORCHESTRATOR__AUTO_RESTRICT=true`
pub const ENV_PREFIX: &str = "PITAYA";

/// Main configuration for the Pitaya daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which processes are restricted and which are sampled
    pub targets: TargetsConfig,

    /// Directives used by automatic restriction runs (default: all)
    pub restriction: RestrictionConfig,

    /// Periodic tick settings
    pub orchestrator: OrchestratorConfig,

    /// Budgets for blocking OS calls
    pub timeouts: TimeoutConfig,

    /// Logging configuration
    pub logging: LogConfig,
}

/// Target names; `re:` prefixes a case-insensitive regex
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsConfig {
    /// Restricted executables (default: SGuard64.exe, SGuardSvc64.exe)
    pub restrict: Vec<String>,

    /// Sampled executables (default: ACE agent plus supported games)
    pub watch: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Tick period in seconds (default: 60)
    pub tick_interval_secs: u64,

    /// Restrict targets on every tick (default: false)
    pub auto_restrict: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per-call budget for enumeration, mutation and registry I/O (default: 5000)
    pub call_timeout_ms: u64,

    /// Spacing of the two CPU-time reads (default: 500)
    pub sample_window_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log directory path (default: ./logs)
    pub log_dir: PathBuf,

    /// Daily-rolled log file name (default: pitaya-daemon.log)
    pub file_name: String,

    /// Filter used when RUST_LOG is unset (default: info)
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            targets: TargetsConfig::default(),
            restriction: RestrictionConfig::all(),
            orchestrator: OrchestratorConfig::default(),
            timeouts: TimeoutConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

fn to_strings(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            restrict: to_strings(DEFAULT_RESTRICTION_TARGETS),
            watch: to_strings(DEFAULT_WATCH_LIST),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 60,
            auto_restrict: false,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            sample_window_ms: 500,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            file_name: "pitaya-daemon.log".to_string(),
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply `PITAYA__*`
    /// environment overrides. Missing keys keep their defaults.
    ///
    /// # Example
    /// ```no_run
    /// use pitaya_daemon::config::Config;
    ///
    /// let config = Config::load_from_file("pitaya.toml").unwrap();
    /// println!("Tick: {}s", config.orchestrator.tick_interval_secs);
    /// ```
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_layered(
            Some(path.as_ref()),
            ::config::Environment::with_prefix(ENV_PREFIX),
        )
    }

    /// Defaults plus environment overrides, without a file
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_layered(None, ::config::Environment::with_prefix(ENV_PREFIX))
    }

    fn load_layered(
        path: Option<&Path>,
        env: ::config::Environment,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        let settings = builder
            .add_source(env.separator("__").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.targets.restrict.is_empty() && self.targets.watch.is_empty() {
            return Err("At least one restrict or watch target is required".to_string());
        }

        for name in self.targets.restrict.iter().chain(&self.targets.watch) {
            pitaya_core::TargetPattern::parse(name).map_err(|e| e.to_string())?;
        }

        if self.orchestrator.tick_interval_secs == 0 {
            return Err("Tick interval must be > 0".to_string());
        }

        if self.timeouts.call_timeout_ms == 0 {
            return Err("Call timeout must be > 0".to_string());
        }

        if self.timeouts.sample_window_ms == 0 {
            return Err("Sample window must be > 0".to_string());
        }

        if self.timeouts.sample_window_ms >= self.orchestrator.tick_interval_secs * 1000 {
            return Err(format!(
                "Sample window ({}ms) must be shorter than the tick interval ({}s)",
                self.timeouts.sample_window_ms, self.orchestrator.tick_interval_secs
            ));
        }

        if self.logging.file_name.is_empty() {
            return Err("Log file name must not be empty".to_string());
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.orchestrator.tick_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.call_timeout_ms)
    }

    pub fn sample_window(&self) -> Duration {
        Duration::from_millis(self.timeouts.sample_window_ms)
    }

    /// Get full path to the daemon log file
    pub fn log_path(&self) -> PathBuf {
        self.logging.log_dir.join(&self.logging.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with(vars: &[(&str, &str)]) -> ::config::Environment {
        let source: ::config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ::config::Environment::with_prefix(ENV_PREFIX).source(Some(source))
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.orchestrator.tick_interval_secs, 60);
        assert!(!config.orchestrator.auto_restrict);
        assert_eq!(config.timeouts.call_timeout_ms, 5000);
        assert_eq!(config.timeouts.sample_window_ms, 500);
        assert_eq!(config.targets.restrict, vec!["SGuard64.exe", "SGuardSvc64.exe"]);
        assert_eq!(config.targets.watch.len(), 4);
        assert_eq!(config.restriction, RestrictionConfig::all());
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_interval() {
        let mut config = Config::default();
        config.orchestrator.tick_interval_secs = 0;

        let result = config.validate();
        assert!(result.unwrap_err().contains("Tick interval"));
    }

    #[test]
    fn test_config_validation_window_longer_than_tick() {
        let mut config = Config::default();
        config.orchestrator.tick_interval_secs = 1;
        config.timeouts.sample_window_ms = 1500;

        assert!(config.validate().unwrap_err().contains("Sample window"));
    }

    #[test]
    fn test_config_validation_bad_pattern() {
        let mut config = Config::default();
        config.targets.watch.push("re:([".to_string());

        assert!(config.validate().unwrap_err().contains("Invalid pattern"));
    }

    #[test]
    fn test_log_path() {
        let config = Config::default();
        assert_eq!(config.log_path(), PathBuf::from("./logs/pitaya-daemon.log"));
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = toml::to_string(&Config::default()).unwrap();

        assert!(toml_str.contains("[targets]"));
        assert!(toml_str.contains("[restriction]"));
        assert!(toml_str.contains("tick_interval_secs = 60"));
        assert!(toml_str.contains("cpu_affinity = true"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = std::env::temp_dir().join(format!("pitaya-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("partial.toml");
        std::fs::write(
            &path,
            r#"
                [restriction]
                cpu_affinity = true
                process_priority = true

                [orchestrator]
                auto_restrict = true
            "#,
        )
        .unwrap();

        let config = Config::load_layered(Some(&path), env_with(&[])).unwrap();
        std::fs::remove_dir_all(&dir).ok();

        assert!(config.restriction.cpu_affinity);
        assert!(!config.restriction.memory_priority);
        assert!(config.orchestrator.auto_restrict);
        assert_eq!(config.orchestrator.tick_interval_secs, 60);
        assert_eq!(config.targets, TargetsConfig::default());
    }

    #[test]
    fn test_environment_overrides() {
        let env = env_with(&[
            ("PITAYA__ORCHESTRATOR__TICK_INTERVAL_SECS", "15"),
            ("PITAYA__RESTRICTION__IO_PRIORITY", "true"),
        ]);

        let config = Config::load_layered(None, env).unwrap();
        assert_eq!(config.orchestrator.tick_interval_secs, 15);
        assert!(config.restriction.io_priority);
        assert_eq!(config.timeouts.call_timeout_ms, 5000);
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = Config::load_layered(
            Some(Path::new("/nonexistent/pitaya.toml")),
            env_with(&[]),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join(format!("pitaya-save-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");

        let mut config = Config::default();
        config.orchestrator.auto_restrict = true;
        config.restriction = RestrictionConfig::all();
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_layered(Some(&path), env_with(&[])).unwrap();
        std::fs::remove_dir_all(&dir).ok();
        assert_eq!(loaded, config);
    }
}
