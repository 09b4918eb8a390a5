//! Controller configuration: `key = value` pairs, one per line.
//!
//! Unknown keys produce a warning, not an error, so that configurations
//! shared with external collaborators keep loading.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::blocks::BlockMode;
use crate::common::error::SlateError;
use crate::select::request::CrType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// When set, node live counts are trusted from configuration instead of
    /// being re-checked against node registration messages.
    pub fast_schedule: bool,
    /// Granularity the consumable-resource selector tracks.
    pub select_type: CrType,
    /// Grace period after a job's time limit before it is forced to TIMEOUT.
    pub kill_wait: Duration,
    pub inactive_limit: Duration,
    /// Uid allowed to mutate any job or partition.
    pub manager_uid: u32,
    pub max_job_count: u32,
    /// Terminal jobs younger than this are kept for queries before purge.
    pub min_job_age: Duration,
    pub state_save_location: PathBuf,
    pub tmp_fs: PathBuf,
    /// Period of snapshot writes and of block reconciliation.
    pub state_save_interval: Duration,
    /// Grace period after credential expiry before GC drops the live entry.
    pub expiration_window: Duration,
    pub block_poll_interval: Duration,
    pub fabric_poll_interval: Duration,
    /// Grid extent per dimension; unset for non-grid clusters, where
    /// block planning is skipped entirely.
    pub grid_dims: Option<Vec<u32>>,
    pub block_mode: BlockMode,
    /// Configured block names for STATIC and OVERLAP modes.
    pub blocks: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            fast_schedule: true,
            select_type: CrType::Cpu,
            kill_wait: Duration::from_secs(30),
            inactive_limit: Duration::from_secs(0),
            manager_uid: 0,
            max_job_count: 5000,
            min_job_age: Duration::from_secs(300),
            state_save_location: PathBuf::from("/var/spool/slate"),
            tmp_fs: PathBuf::from("/tmp"),
            state_save_interval: Duration::from_secs(60),
            expiration_window: Duration::from_secs(600),
            block_poll_interval: Duration::from_secs(30),
            fabric_poll_interval: Duration::from_secs(60),
            grid_dims: None,
            block_mode: BlockMode::Static,
            blocks: Vec::new(),
        }
    }
}

impl ControllerConfig {
    pub fn parse(text: &str) -> crate::Result<ControllerConfig> {
        let mut config = ControllerConfig::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                SlateError::InvalidRequest(format!("config line {}: missing '='", lineno + 1))
            })?;
            config.apply(key.trim(), value.trim(), lineno + 1)?;
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str, lineno: usize) -> crate::Result<()> {
        let bad = |key: &str| {
            SlateError::InvalidRequest(format!("config line {lineno}: invalid value for {key}"))
        };
        match key {
            "FastSchedule" => {
                self.fast_schedule = parse_number(value).map_err(|_| bad(key))? != 0;
            }
            "SelectType" => {
                self.select_type = match value {
                    "CR_CPU" => CrType::Cpu,
                    "CR_Core" => CrType::Core,
                    "CR_Socket" => CrType::Socket,
                    "CR_Memory" => CrType::Memory,
                    "CR_CPU_Memory" => CrType::CpuMemory,
                    "CR_Core_Memory" => CrType::CoreMemory,
                    "CR_Socket_Memory" => CrType::SocketMemory,
                    _ => return Err(bad(key)),
                };
            }
            "KillWait" => self.kill_wait = parse_seconds(value).map_err(|_| bad(key))?,
            "InactiveLimit" => self.inactive_limit = parse_seconds(value).map_err(|_| bad(key))?,
            "ManagerUserId" => self.manager_uid = parse_number(value).map_err(|_| bad(key))? as u32,
            "MaxJobCount" => self.max_job_count = parse_number(value).map_err(|_| bad(key))? as u32,
            "MinJobAge" => self.min_job_age = parse_seconds(value).map_err(|_| bad(key))?,
            "StateSaveLocation" => self.state_save_location = PathBuf::from(value),
            "TmpFs" => self.tmp_fs = PathBuf::from(value),
            "StateSaveInterval" => {
                self.state_save_interval = parse_seconds(value).map_err(|_| bad(key))?
            }
            "ExpirationWindow" => {
                self.expiration_window = parse_seconds(value).map_err(|_| bad(key))?
            }
            "BlockPollInterval" => {
                self.block_poll_interval = parse_seconds(value).map_err(|_| bad(key))?
            }
            "FabricPollInterval" => {
                self.fabric_poll_interval = parse_seconds(value).map_err(|_| bad(key))?
            }
            "GridDims" => {
                let dims: Vec<u32> = value
                    .split('x')
                    .map(|d| d.trim().parse::<u32>())
                    .collect::<Result<_, _>>()
                    .map_err(|_| bad(key))?;
                if dims.is_empty() {
                    return Err(bad(key));
                }
                self.grid_dims = Some(dims);
            }
            "BlockMode" => {
                self.block_mode = match value {
                    "STATIC" => BlockMode::Static,
                    "OVERLAP" => BlockMode::Overlap,
                    "DYNAMIC" => BlockMode::Dynamic,
                    _ => return Err(bad(key)),
                };
            }
            "Blocks" => {
                self.blocks = value
                    .split(',')
                    .map(|b| b.trim().to_string())
                    .filter(|b| !b.is_empty())
                    .collect();
            }
            unknown => {
                log::warn!("Ignoring unknown configuration key '{unknown}' on line {lineno}");
            }
        }
        Ok(())
    }
}

fn parse_number(value: &str) -> Result<u64, std::num::ParseIntError> {
    value.parse::<u64>()
}

/// Accepts either a bare number of seconds or a humantime string ("5m").
fn parse_seconds(value: &str) -> anyhow::Result<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    Ok(humantime::parse_duration(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults_on_empty() {
        let config = ControllerConfig::parse("").unwrap();
        assert_eq!(config.kill_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_parse_known_keys() {
        let config = ControllerConfig::parse(
            "KillWait = 45\nMaxJobCount=100\nStateSaveLocation=/srv/slate\nExpirationWindow=2m\n",
        )
        .unwrap();
        assert_eq!(config.kill_wait, Duration::from_secs(45));
        assert_eq!(config.max_job_count, 100);
        assert_eq!(config.state_save_location, PathBuf::from("/srv/slate"));
        assert_eq!(config.expiration_window, Duration::from_secs(120));
    }

    #[test]
    fn test_parse_grid_keys() {
        let config = ControllerConfig::parse(
            "GridDims = 4x4x4\nBlockMode = OVERLAP\nBlocks = 000x111, 200x311\n",
        )
        .unwrap();
        assert_eq!(config.grid_dims, Some(vec![4, 4, 4]));
        assert_eq!(config.block_mode, BlockMode::Overlap);
        assert_eq!(config.blocks, vec!["000x111", "200x311"]);
        assert!(ControllerConfig::parse("BlockMode = RING\n").is_err());
        assert!(ControllerConfig::parse("GridDims = 4xx4\n").is_err());
    }

    #[test]
    fn test_unknown_key_is_warning_only() {
        assert!(ControllerConfig::parse("NoSuchKey = 1\n").is_ok());
    }

    #[test]
    fn test_comments_and_blank_lines() {
        let config = ControllerConfig::parse("# comment\n\nKillWait=10\n").unwrap();
        assert_eq!(config.kill_wait, Duration::from_secs(10));
    }

    #[test]
    fn test_bad_line_is_error() {
        assert!(ControllerConfig::parse("KillWait 10\n").is_err());
        assert!(ControllerConfig::parse("KillWait = ten\n").is_err());
    }
}
