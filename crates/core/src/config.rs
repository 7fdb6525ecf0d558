//! Search configuration via `search.toml`
//!
//! Process-wide knobs for the search layer. Per-index tuning (intervals,
//! consolidation policy, write buffers) lives in the index metadata instead.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Config file name placed in the data directory.
pub const CONFIG_FILE_NAME: &str = "search.toml";

/// What a query does when it hits an index marked out of sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutOfSyncPolicy {
    /// Refuse the query with an out-of-sync error
    #[default]
    Fail,
    /// Run the query and log a warning
    Warn,
}

/// Search configuration loaded from `search.toml`.
///
/// # Example
///
/// ```toml
/// default_parallelism = 1
/// out_of_sync_policy = "fail"
/// maintenance_threads = 2
/// maintenance_queue_depth = 1024
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchConfig {
    /// Segment-processing threads used when a query does not set `parallelism`
    #[serde(default = "default_parallelism")]
    pub default_parallelism: usize,
    /// Behaviour for indexes marked out of sync
    #[serde(default)]
    pub out_of_sync_policy: OutOfSyncPolicy,
    /// Worker threads running commit/consolidation/cleanup
    #[serde(default = "default_maintenance_threads")]
    pub maintenance_threads: usize,
    /// Maximum number of queued maintenance tasks
    #[serde(default = "default_queue_depth")]
    pub maintenance_queue_depth: usize,
}

fn default_parallelism() -> usize {
    1
}

fn default_maintenance_threads() -> usize {
    2
}

fn default_queue_depth() -> usize {
    1024
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_parallelism: default_parallelism(),
            out_of_sync_policy: OutOfSyncPolicy::default(),
            maintenance_threads: default_maintenance_threads(),
            maintenance_queue_depth: default_queue_depth(),
        }
    }
}

impl SearchConfig {
    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.default_parallelism == 0 {
            return Err(Error::bad_parameter(
                "default_parallelism in search.toml must be positive",
            ));
        }
        if self.maintenance_threads == 0 {
            return Err(Error::bad_parameter(
                "maintenance_threads in search.toml must be positive",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Search configuration
#
# Segment-processing threads per query when the query sets no
# "parallelism" option (default: 1)
default_parallelism = 1

# Queries against an index marked out of sync: "fail" (default) or "warn"
out_of_sync_policy = "fail"

# Background commit / consolidation / cleanup workers (default: 2)
maintenance_threads = 2

# Maximum queued maintenance tasks (default: 1024)
maintenance_queue_depth = 1024
"#
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::internal(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: SearchConfig = toml::from_str(&content).map_err(|e| {
            Error::bad_parameter(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml()).map_err(|e| {
                Error::internal(format!(
                    "Failed to write default config file '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_toml_parses_to_default() {
        let parsed: SearchConfig = toml::from_str(SearchConfig::default_toml()).unwrap();
        assert_eq!(parsed, SearchConfig::default());
    }

    #[test]
    fn test_write_default_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        SearchConfig::write_default_if_missing(&path).unwrap();
        let cfg = SearchConfig::from_file(&path).unwrap();
        assert_eq!(cfg.out_of_sync_policy, OutOfSyncPolicy::Fail);
    }

    #[test]
    fn test_write_default_keeps_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "out_of_sync_policy = \"warn\"\n").unwrap();
        SearchConfig::write_default_if_missing(&path).unwrap();
        let cfg = SearchConfig::from_file(&path).unwrap();
        assert_eq!(cfg.out_of_sync_policy, OutOfSyncPolicy::Warn);
        assert_eq!(cfg.default_parallelism, 1);
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "default_parallelism = 0\n").unwrap();
        assert!(SearchConfig::from_file(&path).unwrap_err().is_bad_parameter());
    }

    #[test]
    fn test_rejects_unknown_policy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "out_of_sync_policy = \"maybe\"\n").unwrap();
        assert!(SearchConfig::from_file(&path).is_err());
    }
}
