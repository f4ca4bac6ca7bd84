use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{KiteError, Result};

/// Which storage driver backs the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverChoice {
    /// In-memory ordered map with version chains. Volatile; full snapshot
    /// support. The reference engine.
    Mem,
    /// Bundled log-structured merge engine. Durable; no snapshots.
    Lsm { path: PathBuf },
    /// External embedded KV (sled). Durable; no snapshots.
    Sled { path: PathBuf },
}

/// Top-level database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub driver: DriverChoice,
    #[serde(default)]
    pub lsm: LsmSection,
}

/// LSM driver tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsmSection {
    /// Maximum memtable size in bytes before it is frozen and flushed.
    pub memtable_budget_bytes: u64,
    /// Number of L0 tables that triggers a merge compaction.
    pub l0_compaction_trigger: usize,
    /// Whether SST flushes fsync before the memtable is released.
    pub sync_flush: bool,
}

impl Default for LsmSection {
    fn default() -> Self {
        Self {
            memtable_budget_bytes: 8 * 1024 * 1024, // 8 MB
            l0_compaction_trigger: 6,
            sync_flush: true,
        }
    }
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self {
            driver: DriverChoice::Mem,
            lsm: LsmSection::default(),
        }
    }

    /// Parse the location string accepted by `open`.
    ///
    /// - empty or `mem:` → in-memory driver
    /// - `lsm://<path>` or a bare filesystem path → LSM driver at `<path>`
    /// - `sled://<path>` → sled driver at `<path>`
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() || location == "mem:" || location == "mem://" {
            return Ok(Self::in_memory());
        }
        if let Some(path) = location.strip_prefix("sled://") {
            if path.is_empty() {
                return Err(KiteError::InvalidArgument(
                    "sled:// location requires a path".into(),
                ));
            }
            return Ok(Self {
                driver: DriverChoice::Sled { path: path.into() },
                lsm: LsmSection::default(),
            });
        }
        let path = location.strip_prefix("lsm://").unwrap_or(location);
        if let Some((scheme, _)) = path.split_once("://") {
            return Err(KiteError::InvalidArgument(format!(
                "unknown driver scheme: {scheme}"
            )));
        }
        if path.is_empty() {
            return Err(KiteError::InvalidArgument(
                "lsm:// location requires a path".into(),
            ));
        }
        Ok(Self {
            driver: DriverChoice::Lsm { path: path.into() },
            lsm: LsmSection::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_is_memory() {
        assert_eq!(DatabaseConfig::parse("").unwrap().driver, DriverChoice::Mem);
        assert_eq!(
            DatabaseConfig::parse("mem:").unwrap().driver,
            DriverChoice::Mem
        );
    }

    #[test]
    fn test_parse_bare_path_is_lsm() {
        let cfg = DatabaseConfig::parse("/tmp/kite-data").unwrap();
        assert_eq!(
            cfg.driver,
            DriverChoice::Lsm {
                path: "/tmp/kite-data".into()
            }
        );
    }

    #[test]
    fn test_parse_schemes() {
        let cfg = DatabaseConfig::parse("lsm:///var/kite").unwrap();
        assert_eq!(
            cfg.driver,
            DriverChoice::Lsm {
                path: "/var/kite".into()
            }
        );
        let cfg = DatabaseConfig::parse("sled:///var/sled").unwrap();
        assert_eq!(
            cfg.driver,
            DriverChoice::Sled {
                path: "/var/sled".into()
            }
        );
    }

    #[test]
    fn test_parse_unknown_scheme_rejected() {
        assert!(DatabaseConfig::parse("rocks:///x").is_err());
        assert!(DatabaseConfig::parse("sled://").is_err());
    }
}
