//! Runtime configuration.
//!
//! Values are layered lowest to highest precedence: compiled-in defaults,
//! then an optional config file, then process environment variables, then
//! explicit constructor overrides (used by tests).

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM, LIVENESS_CHECK_INTERVAL, TERMINATE_GRACE_PERIOD,
};

/// The selected runtime environment, mirroring `VTSESSION_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Normal operation; control root defaults to the platform data directory.
    Production,
    /// Local development; more verbose defaults.
    Development,
    /// Test mode; control root defaults to a scratch directory under the
    /// workspace's `tmp/`, never the platform data directory.
    Test,
}

impl Environment {
    /// Reads `VTSESSION_ENV`, defaulting to [`Environment::Production`].
    #[must_use]
    pub fn current() -> Self {
        match std::env::var("VTSESSION_ENV").as_deref() {
            Ok("development") | Ok("dev") => Environment::Development,
            Ok("test") => Environment::Test,
            _ => {
                if cfg!(test) {
                    Environment::Test
                } else {
                    Environment::Production
                }
            }
        }
    }

    /// True when running under test mode (unit tests or `VTSESSION_ENV=test`).
    #[must_use]
    pub fn is_test(self) -> bool {
        matches!(self, Environment::Test)
    }
}

/// Process-wide configuration for the session runtime and its ambient stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory under which every session gets its own subdirectory.
    pub control_root: PathBuf,
    /// Default terminal width for sessions that do not specify one.
    pub default_cols: u16,
    /// Default terminal height for sessions that do not specify one.
    pub default_rows: u16,
    /// Default `TERM` value presented to spawned children.
    pub default_term: String,
    /// Minimum interval between buffer-manager liveness sweeps, in milliseconds.
    pub liveness_check_interval_ms: u64,
    /// Grace period before escalating from SIGTERM to SIGKILL, in milliseconds.
    pub terminate_grace_period_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_root: default_control_root(),
            default_cols: DEFAULT_COLS,
            default_rows: DEFAULT_ROWS,
            default_term: DEFAULT_TERM.to_string(),
            liveness_check_interval_ms: LIVENESS_CHECK_INTERVAL.as_millis() as u64,
            terminate_grace_period_ms: TERMINATE_GRACE_PERIOD.as_millis() as u64,
        }
    }
}

fn default_control_root() -> PathBuf {
    if Environment::current().is_test() {
        return PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/vtsession-test");
    }
    dirs::data_dir()
        .map(|d| d.join("vtsession"))
        .unwrap_or_else(|| PathBuf::from("/tmp/vtsession"))
}

impl Config {
    /// Returns the directory holding the (optional) persisted `config.json`,
    /// creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(over) = std::env::var("VTSESSION_CONFIG_DIR") {
            PathBuf::from(over)
        } else if Environment::current().is_test() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/vtsession-test")
        } else {
            dirs::config_dir()
                .context("could not determine platform config directory")?
                .join("vtsession")
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration by layering defaults, an optional on-disk file,
    /// and environment variable overrides.
    ///
    /// # Errors
    ///
    /// Never fails on a missing config file (defaults are used instead); can
    /// fail if an existing config file contains invalid JSON.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("VTSESSION_CONTROL_ROOT") {
            self.control_root = PathBuf::from(root);
        }
        if let Ok(term) = std::env::var("VTSESSION_DEFAULT_TERM") {
            self.default_term = term;
        }
        if let Ok(cols) = std::env::var("VTSESSION_DEFAULT_COLS") {
            if let Ok(n) = cols.parse() {
                self.default_cols = n;
            }
        }
        if let Ok(rows) = std::env::var("VTSESSION_DEFAULT_ROWS") {
            if let Ok(n) = rows.parse() {
                self.default_rows = n;
            }
        }
    }

    /// Persists the configuration to `config.json` under [`Config::config_dir`].
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be resolved or the file
    /// cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_dir()?.join("config.json");
        std::fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Path to the directory owning a given session's on-disk files.
    #[must_use]
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.control_root.join(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_spec_dimensions() {
        let config = Config::default();
        assert_eq!(config.default_cols, 120);
        assert_eq!(config.default_rows, 30);
        assert_eq!(config.default_term, "xterm-256color");
    }

    #[test]
    fn env_override_changes_control_root() {
        let dir = std::env::temp_dir().join("vtsession-cfg-test");
        std::env::set_var("VTSESSION_CONTROL_ROOT", &dir);
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.control_root, dir);
        std::env::remove_var("VTSESSION_CONTROL_ROOT");
    }

    #[test]
    fn session_dir_nests_under_control_root() {
        let config = Config {
            control_root: PathBuf::from("/tmp/vtsession"),
            ..Config::default()
        };
        assert_eq!(
            config.session_dir("abc123"),
            PathBuf::from("/tmp/vtsession/abc123")
        );
    }

    #[test]
    fn environment_defaults_to_test_under_cfg_test() {
        assert!(Environment::current().is_test());
    }
}
