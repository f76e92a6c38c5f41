//! Runtime configuration for the settings engine.
//!
//! Every section has a `Default` impl, so an empty or missing TOML file yields
//! the stock behaviour. Example:
//!
//! ```toml
//! host_id = "c8cda597-d957-4625-a4ae-ba9af4e4e2b0"
//! scheme = "Work"
//!
//! [scheduler]
//! write_back_delay_ms = 500
//!
//! [service]
//! use_file_watchers = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Result, SettingsError};

/* ------------------------------------------------------------------------- */
/* Section Models                                                            */
/* ------------------------------------------------------------------------- */

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Quiet period after the last change before a write is queued.
    pub write_back_delay_ms: u64,
    /// Quiet period after the last file system event before a change is reported.
    pub watcher_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            write_back_delay_ms: 500,
            watcher_delay_ms: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn write_back_delay(&self) -> Duration {
        Duration::from_millis(self.write_back_delay_ms)
    }

    pub fn watcher_delay(&self) -> Duration {
        Duration::from_millis(self.watcher_delay_ms)
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub supports_all_users: bool,
    pub use_file_watchers: bool,
    pub raise_changed_event_after_writing: bool,
    pub read_retry_delay_ms: u64,
    pub write_retry_count: u32,
    pub write_retry_delay_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            supports_all_users: true,
            use_file_watchers: true,
            raise_changed_event_after_writing: false,
            read_retry_delay_ms: 50,
            write_retry_count: 5,
            write_retry_delay_ms: 50,
        }
    }
}

impl ServiceConfig {
    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Id under which the host application keeps its own settings.
    pub host_id: Uuid,
    /// Active scheme; appended to the settings file names when set.
    pub scheme: Option<String>,
    pub scheduler: SchedulerConfig,
    pub service: ServiceConfig,
}

impl RuntimeConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SettingsError::Config(e.to_string()))
    }

    /// Loads the config file, falling back to defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Self::from_toml_str(&text)
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = Some(scheme.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_text_gives_defaults() {
        let cfg = RuntimeConfig::from_toml_str("").expect("parse");
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.scheduler.write_back_delay(), Duration::from_millis(500));
        assert_eq!(cfg.service.write_retry_count, 5);
        assert!(cfg.service.supports_all_users);
        assert!(!cfg.service.raise_changed_event_after_writing);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = RuntimeConfig::from_toml_str(
            r#"
scheme = "Work"

[scheduler]
write_back_delay_ms = 20

[service]
use_file_watchers = false
"#,
        )
        .expect("parse");

        assert_eq!(cfg.scheme.as_deref(), Some("Work"));
        assert_eq!(cfg.scheduler.write_back_delay_ms, 20);
        assert_eq!(cfg.scheduler.watcher_delay_ms, 500);
        assert!(!cfg.service.use_file_watchers);
        assert_eq!(cfg.service.read_retry_delay_ms, 50);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = RuntimeConfig::from_toml_str("scheduler = 3").expect_err("should fail");
        assert!(matches!(err, SettingsError::Config(_)));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = RuntimeConfig::load(dir.path().join("absent.toml")).expect("load");
        assert_eq!(cfg, RuntimeConfig::default());
    }
}
