//! Server configuration: defaults, TOML file loading, CLI overrides.
//!
//! Every field has a default so a bare `garnet-server` starts a
//! non-persistent single-node server on 127.0.0.1:6379. A config file
//! given with `--config` is TOML with `[rdb]`, `[aof]` and `[replica]`
//! sections; `--port` and `--bind` override the file.

use std::fs;
use std::path::{Path, PathBuf};

use garnet_persistence::aof::{AofOptions, FsyncPolicy};
use garnet_persistence::rdb::RdbOptions;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub port: u16,
    pub bind_address: String,
    pub rdb: RdbSection,
    pub aof: AofSection,
    pub replica: ReplicaSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 6379,
            bind_address: "127.0.0.1".into(),
            rdb: RdbSection::default(),
            aof: AofSection::default(),
            replica: ReplicaSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RdbSection {
    pub enabled: bool,
    pub dir: PathBuf,
    pub filename: String,
}

impl Default for RdbSection {
    fn default() -> Self {
        let defaults = RdbOptions::default();
        Self {
            enabled: defaults.enabled,
            dir: defaults.dir,
            filename: defaults.filename,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AofSection {
    pub enabled: bool,
    /// One of `always`, `everysec`, `no`.
    pub mode: String,
    pub dir: PathBuf,
    pub filename: String,
    pub auto_rewrite_min_size: u64,
    pub auto_rewrite_percentage: u64,
}

impl Default for AofSection {
    fn default() -> Self {
        let defaults = AofOptions::default();
        Self {
            enabled: defaults.enabled,
            mode: "everysec".into(),
            dir: defaults.dir,
            filename: defaults.filename,
            auto_rewrite_min_size: defaults.auto_rewrite_min_size,
            auto_rewrite_percentage: defaults.auto_rewrite_percentage,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicaSection {
    pub enabled: bool,
    pub master_host: String,
    pub master_port: u16,
}

/// Parses an fsync policy name.
pub fn parse_fsync_policy(input: &str) -> Result<FsyncPolicy, String> {
    match input.to_ascii_lowercase().as_str() {
        "always" => Ok(FsyncPolicy::Always),
        "everysec" => Ok(FsyncPolicy::EverySec),
        "no" => Ok(FsyncPolicy::No),
        _ => Err(format!(
            "unknown fsync policy '{input}'. valid options: always, everysec, no"
        )),
    }
}

impl ServerConfig {
    /// Loads and parses a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("cannot read config file '{}': {e}", path.display()))?;
        toml::from_str(&text)
            .map_err(|e| format!("cannot parse config file '{}': {e}", path.display()))
    }

    pub fn rdb_options(&self) -> RdbOptions {
        RdbOptions {
            enabled: self.rdb.enabled,
            dir: self.rdb.dir.clone(),
            filename: self.rdb.filename.clone(),
        }
    }

    pub fn aof_options(&self) -> Result<AofOptions, String> {
        Ok(AofOptions {
            enabled: self.aof.enabled,
            mode: parse_fsync_policy(&self.aof.mode)?,
            dir: self.aof.dir.clone(),
            filename: self.aof.filename.clone(),
            auto_rewrite_min_size: self.aof.auto_rewrite_min_size,
            auto_rewrite_percentage: self.aof.auto_rewrite_percentage,
        })
    }
}
