use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::{DEFAULT_OUTPUT_BUFFER_LIMIT, DEFAULT_REPLAY_MAX_PAGES, DEFAULT_REPLAY_PAGE_SIZE};

pub const ENV_OUTPUT_BUFFER_LIMIT: &str = "DECKHAND_OUTPUT_BUFFER_LIMIT";
pub const ENV_START_TIMEOUT_MS: &str = "DECKHAND_START_TIMEOUT_MS";
pub const ENV_REPLAY_PAGE_SIZE: &str = "DECKHAND_REPLAY_PAGE_SIZE";

/// Tuning shared by every session mounted in one process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bytes of output held before the terminal is ready; `None` or 0 is unbounded
    #[serde(default = "default_output_buffer_limit")]
    pub output_buffer_limit: Option<usize>,
    /// Give up on a start that shows no sign of life after this long
    #[serde(default)]
    pub start_timeout_ms: Option<u64>,
    #[serde(default = "default_replay_page_size")]
    pub replay_page_size: u32,
    /// Upper bound on pages fetched by one replay
    #[serde(default = "default_replay_max_pages")]
    pub replay_max_pages: u32,
}

fn default_output_buffer_limit() -> Option<usize> {
    Some(DEFAULT_OUTPUT_BUFFER_LIMIT)
}

fn default_replay_page_size() -> u32 {
    DEFAULT_REPLAY_PAGE_SIZE
}

fn default_replay_max_pages() -> u32 {
    DEFAULT_REPLAY_MAX_PAGES
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            output_buffer_limit: default_output_buffer_limit(),
            start_timeout_ms: None,
            replay_page_size: default_replay_page_size(),
            replay_max_pages: default_replay_max_pages(),
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from a TOML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        log::debug!("[terminal_bridge] loaded config from {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source; unset or blank values are skipped
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(limit) = parse_var(&lookup, ENV_OUTPUT_BUFFER_LIMIT)? {
            self.output_buffer_limit = Some(limit);
        }
        if let Some(timeout) = parse_var::<u64, _>(&lookup, ENV_START_TIMEOUT_MS)? {
            self.start_timeout_ms = (timeout > 0).then_some(timeout);
        }
        if let Some(page_size) = parse_var(&lookup, ENV_REPLAY_PAGE_SIZE)? {
            self.replay_page_size = page_size;
        }
        Ok(())
    }

    pub fn buffer_limit(&self) -> Option<usize> {
        self.output_buffer_limit.filter(|limit| *limit > 0)
    }

    pub fn start_timeout(&self) -> Option<Duration> {
        self.start_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Page size sent with replay requests, never zero
    pub fn replay_limit(&self) -> u32 {
        self.replay_page_size.max(1)
    }
}

fn parse_var<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let value = raw.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|_| ConfigError::Env {
        var,
        value: raw.clone(),
    })
}
