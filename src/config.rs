//! Configuration related structures.
use std::path::PathBuf;

use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

#[derive(Builder, Parser, CopyGetters, Getters, Deserialize, Serialize)]
#[builder(default, pattern = "owned", setter(into))]
#[serde(rename_all = "kebab-case")]
#[command(
    name = "cellblockd",
    about = "Instance dispatcher daemon for a lightweight BSD jail container manager",
    after_help = "More info at: https://github.com/csjayp/cellblock"
)]
pub struct Config {
    #[get_copy = "pub"]
    #[arg(
        default_value("info"),
        env("CELLBLOCKD_LOG_LEVEL"),
        long("log-level"),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the daemon.
    log_level: LevelFilter,

    #[get = "pub"]
    #[arg(
        default_value("/var/run/cellblockd/cellblockd.sock"),
        env("CELLBLOCKD_SOCK_PATH"),
        long("sock-path")
    )]
    /// The path to the unix socket clients connect to.
    sock_path: PathBuf,

    #[get = "pub"]
    #[arg(
        default_value("/var/cellblock"),
        env("CELLBLOCKD_DATA_DIR"),
        long("data-dir")
    )]
    /// Root of persistent on-disk state: locks, instances, helper scripts.
    data_dir: PathBuf,

    #[get = "pub"]
    #[arg(
        default_value("zfs"),
        env("CELLBLOCKD_FS"),
        long("fs"),
        value_name("FSTYPE")
    )]
    /// Underlying filesystem tag passed to helper scripts as `CBLOCK_FS`.
    underlying_fs: String,

    #[get_copy = "pub"]
    #[arg(short('v'), long("verbose"))]
    /// Set `-x` in generated build scripts and thread verbosity through
    /// the launch environment.
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse()
    }
}

impl Config {
    /// Path to the directory holding advisory-locked instance pid files.
    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    /// Path to the directory holding uploaded build contexts and build
    /// roots, one subtree per instance tag.
    pub fn instances_dir(&self) -> PathBuf {
        self.data_dir.join("instances")
    }

    /// Path to the external helper script library.
    pub fn lib_dir(&self) -> PathBuf {
        self.data_dir.join("lib")
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn default_config() {
        let c = ConfigBuilder::default().build().expect("build");
        assert_eq!(c.log_level(), LevelFilter::Info);
        assert_eq!(c.underlying_fs(), "zfs");
    }

    #[test]
    fn build_config() -> Result<()> {
        let c = ConfigBuilder::default()
            .log_level(LevelFilter::Warn)
            .sock_path("/some/path")
            .build()?;

        assert_eq!(c.log_level(), LevelFilter::Warn);
        assert_eq!(&c.sock_path().display().to_string(), "/some/path");

        Ok(())
    }

    #[test]
    fn derived_paths() {
        let c = ConfigBuilder::default()
            .data_dir("/var/cellblock")
            .build()
            .expect("build");
        assert_eq!(c.locks_dir(), PathBuf::from("/var/cellblock/locks"));
        assert_eq!(c.instances_dir(), PathBuf::from("/var/cellblock/instances"));
        assert_eq!(c.lib_dir(), PathBuf::from("/var/cellblock/lib"));
    }
}
