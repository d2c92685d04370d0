//! Core configuration: defaults, then an optional JSON file, then `CAIPI_*`
//! environment overrides.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backends::BackendKind;

pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    /// Auto-deny deadline for permission requests. Meant to stay at 60 s outside
    /// tests; zero falls back to the default.
    pub permission_timeout_ms: u64,
    /// Bound on the post-interrupt drain. Zero falls back to the default.
    pub drain_timeout_ms: u64,
    /// Bound on install/auth probes that shell out to the CLI.
    pub probe_timeout_ms: u64,
    pub default_backend: BackendKind,
    pub cli_paths: HashMap<BackendKind, PathBuf>,
    pub default_models: HashMap<BackendKind, String>,
    /// Overrides `~/.claude/settings.json`.
    pub user_settings_path: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            permission_timeout_ms: DEFAULT_PERMISSION_TIMEOUT.as_millis() as u64,
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT.as_millis() as u64,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            default_backend: BackendKind::Claude,
            cli_paths: HashMap::new(),
            default_models: HashMap::from([
                (BackendKind::Claude, "sonnet".to_string()),
                (BackendKind::Codex, "gpt-5.3-codex".to_string()),
            ]),
            user_settings_path: None,
        }
    }
}

impl CoreConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        // A file that names only one model must not erase the other default.
        for (kind, model) in Self::default().default_models {
            config.default_models.entry(kind).or_insert(model);
        }
        Ok(config)
    }

    /// Applies `CAIPI_*` overrides read through `var`. Bad values are logged and skipped.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(value) = var("CAIPI_BACKEND") {
            match value.parse::<BackendKind>() {
                Ok(kind) => self.default_backend = kind,
                Err(e) => log::warn!("ignoring CAIPI_BACKEND: {e}"),
            }
        }
        for (key, slot) in [
            ("CAIPI_DRAIN_TIMEOUT_MS", &mut self.drain_timeout_ms),
            ("CAIPI_PERMISSION_TIMEOUT_MS", &mut self.permission_timeout_ms),
        ] {
            if let Some(value) = var(key) {
                match value.trim().parse::<u64>() {
                    Ok(0) => log::warn!("ignoring {key}=0: timeouts must be positive"),
                    Ok(ms) => *slot = ms,
                    Err(e) => log::warn!("ignoring {key}={value}: {e}"),
                }
            }
        }
        for (key, kind) in [
            ("CAIPI_CLAUDE_PATH", BackendKind::Claude),
            ("CAIPI_CODEX_PATH", BackendKind::Codex),
        ] {
            if let Some(value) = var(key).filter(|v| !v.trim().is_empty()) {
                self.cli_paths.insert(kind, PathBuf::from(value));
            }
        }
    }

    pub fn permission_timeout(&self) -> Duration {
        positive_or(self.permission_timeout_ms, DEFAULT_PERMISSION_TIMEOUT)
    }

    pub fn drain_timeout(&self) -> Duration {
        positive_or(self.drain_timeout_ms, DEFAULT_DRAIN_TIMEOUT)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn cli_path(&self, kind: BackendKind) -> Option<&Path> {
        self.cli_paths.get(&kind).map(PathBuf::as_path)
    }

    pub fn default_model(&self, kind: BackendKind) -> String {
        self.default_models.get(&kind).cloned().unwrap_or_default()
    }
}

fn positive_or(ms: u64, default: Duration) -> Duration {
    match ms {
        0 => default,
        ms => Duration::from_millis(ms),
    }
}
