//! Pipeline configuration.
//!
//! A fixed struct enumerating every recognized option, loaded once at process
//! start from `packline.toml`. Unknown keys are a load error rather than a
//! silent ignore. Retention defaults here are used only when the field
//! contract's `trash_retention` section is absent.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{PolicyReject, RejectCode};
use crate::intake::RawStorageLevel;

/// Directory-lock acquisition timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// Sleep between acquisition attempts, in milliseconds.
    #[serde(default = "default_lock_interval_ms")]
    pub retry_interval_ms: u64,
    /// Attempts before `JOB_JSON_LOCK_TIMEOUT`.
    #[serde(default = "default_lock_retries")]
    pub max_retries: u32,
}

impl LockConfig {
    /// Sleep between attempts as a [`Duration`].
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Worst-case wait across all attempts.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms * self.max_retries as u64)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: default_lock_interval_ms(),
            max_retries: default_lock_retries(),
        }
    }
}

/// The whole pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PipelineConfig {
    pub lock: LockConfig,
    /// How much raw provider payload the intake session retains.
    pub raw_storage_level: RawStorageLevel,
    /// Cap on retained raw response bytes; beyond it the payload is truncated
    /// and flagged.
    pub max_raw_bytes: usize,
    /// Whether the renderer also emits a PDF variant of the document report.
    pub generate_pdf: bool,
    /// Retention defaults, overridden by the contract's `trash_retention`.
    pub retention: crate::contract::RetentionSpec,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            raw_storage_level: RawStorageLevel::Full,
            max_raw_bytes: 1024 * 1024,
            generate_pdf: false,
            retention: crate::contract::RetentionSpec::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads the configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `CONTRACT_INVALID` on a missing file, malformed TOML, or an
    /// unrecognized key.
    pub fn load(path: &Path) -> Result<Self, PolicyReject> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PolicyReject::new(RejectCode::ContractInvalid)
                .with("path", path.display().to_string())
                .with("error", e.to_string())
        })?;
        toml::from_str(&text).map_err(|e| {
            PolicyReject::new(RejectCode::ContractInvalid)
                .with("path", path.display().to_string())
                .with("error", e.to_string())
        })
    }
}

fn default_lock_interval_ms() -> u64 {
    50
}

fn default_lock_retries() -> u32 {
    40
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.lock.retry_interval_ms, 50);
        assert_eq!(config.lock.max_retries, 40);
        assert_eq!(config.lock.max_wait(), Duration::from_secs(2));
        assert_eq!(config.raw_storage_level, RawStorageLevel::Full);
        assert!(!config.generate_pdf);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: PipelineConfig = toml::from_str(
            r#"
raw_storage_level = "minimal"

[lock]
retry_interval_ms = 10
max_retries = 5
"#,
        )
        .expect("parse");
        assert_eq!(config.raw_storage_level, RawStorageLevel::Minimal);
        assert_eq!(config.lock.max_retries, 5);
        assert_eq!(config.max_raw_bytes, 1024 * 1024);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result: Result<PipelineConfig, _> = toml::from_str("mystery = true");
        assert!(result.is_err());
    }
}
