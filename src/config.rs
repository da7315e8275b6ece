//! Typed settings loaded with figment.
//!
//! Settings come from a TOML file merged with `RUNCTL_`-prefixed
//! environment variables, so a deployment can override any value:
//!
//! Nesting uses a double underscore, since section and field names contain
//! single underscores themselves:
//!
//! ```text
//! RUNCTL_APPLICATION__LOG_LEVEL=debug
//! RUNCTL_RUN_CONTROL__BASE_PATH=/RunState
//! RUNCTL_ORCHESTRATOR__SSH_BINARY=/usr/bin/ssh
//! ```

use crate::control::ProgramDefinition;
use crate::error::{RcError, RcResult};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Application-level settings.
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Run-control authority settings.
    #[serde(default)]
    pub run_control: RunControlSettings,
    /// Orchestration engine settings.
    #[serde(default)]
    pub orchestrator: OrchestratorSettings,
    /// Programs seeded into the store at startup.
    #[serde(default)]
    pub programs: Vec<ProgramEntry>,
}

/// Application-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Settings for the run-control authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunControlSettings {
    /// Store directory the run-control schema lives under.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Convergence timeout for transitions.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Change-feed poll interval for the coordination loops.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

/// Settings for the orchestration engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// Remote shell client used to start participants.
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: String,
    /// Dispatcher heartbeat interval.
    #[serde(default = "default_heartbeat", with = "humantime_serde")]
    pub heartbeat: Duration,
}

/// One seeded program: a name plus its definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramEntry {
    /// Program name, unique within the roster.
    pub name: String,
    /// The program's definition.
    #[serde(flatten)]
    pub definition: ProgramDefinition,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_base_path() -> String {
    crate::control::DEFAULT_BASE.to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(crate::control::DEFAULT_TIMEOUT_SECS)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}

fn default_ssh_binary() -> String {
    "ssh".to_string()
}

fn default_heartbeat() -> Duration {
    Duration::from_secs(1)
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for RunControlSettings {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            timeout: default_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            ssh_binary: default_ssh_binary(),
            heartbeat: default_heartbeat(),
        }
    }
}

impl Settings {
    /// Loads `runctl.toml` from the working directory plus environment
    /// overrides.
    pub fn load() -> RcResult<Self> {
        Self::load_from("runctl.toml")
    }

    /// Loads settings from `path` merged with `RUNCTL_`-prefixed
    /// environment variables. The file is optional; defaults cover every
    /// value.
    pub fn load_from(path: impl AsRef<Path>) -> RcResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUNCTL_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks invariants the type system cannot express.
    pub fn validate(&self) -> RcResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(RcError::Config(format!(
                "invalid log_level '{}'; must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        if !self.run_control.base_path.starts_with('/') {
            return Err(RcError::Config(format!(
                "base_path '{}' must be absolute",
                self.run_control.base_path
            )));
        }
        if self.run_control.poll_interval.is_zero() {
            return Err(RcError::Config("poll_interval must be non-zero".into()));
        }
        if self.orchestrator.heartbeat.is_zero() {
            return Err(RcError::Config("heartbeat must be non-zero".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for entry in &self.programs {
            if entry.name.is_empty() {
                return Err(RcError::Config("program name cannot be empty".into()));
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(RcError::Config(format!(
                    "duplicate program '{}'",
                    entry.name
                )));
            }
            if entry.definition.path.is_empty() || entry.definition.host.is_empty() {
                return Err(RcError::Config(format!(
                    "program '{}' needs both path and host",
                    entry.name
                )));
            }
        }
        Ok(())
    }
}
