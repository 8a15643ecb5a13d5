//! Config-file data model.
//!
//! The teacher takes its machine description entirely from `clap` flags
//! (`main.rs`'s `Args`); this VMM instead takes a single `--config_path`
//! flag and deserializes the machine description from a TOML file via
//! `serde`. The struct shapes below are the file format; `clap` is kept
//! only for the one flag, matching the teacher's `#[derive(Parser)]` style.

use std::fs;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("more than one drive/pmem marked rootfs")]
    MultipleRootfs,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    pub machine: MachineConfig,
    pub kernel: KernelConfig,
    #[serde(default)]
    pub uart: UartConfig,
    #[serde(default, rename = "drives")]
    pub drives: Vec<DriveConfig>,
    #[serde(default, rename = "networks")]
    pub networks: Vec<NetworkConfig>,
    #[serde(default, rename = "pmems")]
    pub pmems: Vec<PmemConfig>,
    pub gdb: Option<GdbConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MachineConfig {
    pub vcpus: u32,
    pub memory_mb: u32,
    pub cmdline: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct KernelConfig {
    pub path: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct UartConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone)]
pub struct DriveConfig {
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub io_uring: bool,
    #[serde(default)]
    pub rootfs: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct NetworkConfig {
    pub dev_name: String,
    pub mac: Option<[u8; 6]>,
    #[serde(default)]
    pub vhost: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PmemConfig {
    pub path: String,
    #[serde(default)]
    pub rootfs: bool,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GdbConfig {
    pub socket_path: String,
}

impl Config {
    /// Load and validate a config file. Validation is limited to what the
    /// data model itself can't express (at most one rootfs source between
    /// drives and pmems); everything else is the fields' own types.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&text, path)
    }

    fn parse(text: &str, path: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;

        let rootfs_count = config.drives.iter().filter(|d| d.rootfs).count()
            + config.pmems.iter().filter(|p| p.rootfs).count();
        if rootfs_count > 1 {
            return Err(ConfigError::MultipleRootfs);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [machine]
            vcpus = 1
            memory_mb = 256
            cmdline = "console=ttyAMA0"

            [kernel]
            path = "/boot/Image"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.machine.vcpus, 1);
        assert!(config.uart.enabled);
        assert!(config.drives.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [machine]
            vcpus = 2
            memory_mb = 1024
            cmdline = "console=ttyAMA0 root=/dev/vda"

            [kernel]
            path = "/boot/Image"

            [uart]
            enabled = false

            [[drives]]
            path = "/data/rootfs.img"
            read_only = false
            io_uring = true
            rootfs = true

            [[networks]]
            dev_name = "tap0"
            mac = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01]
            vhost = true

            [[pmems]]
            path = "/data/scratch.pmem"
            rootfs = false

            [gdb]
            socket_path = "/tmp/basalt-gdb.sock"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(!config.uart.enabled);
        assert_eq!(config.drives.len(), 1);
        assert!(config.drives[0].rootfs);
        assert_eq!(config.networks[0].mac, Some([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]));
        assert_eq!(config.pmems.len(), 1);
        assert_eq!(
            config.gdb.as_ref().unwrap().socket_path,
            "/tmp/basalt-gdb.sock"
        );
    }

    #[test]
    fn test_multiple_rootfs_rejected() {
        let toml = r#"
            [machine]
            vcpus = 1
            memory_mb = 256
            cmdline = "console=ttyAMA0"

            [kernel]
            path = "/boot/Image"

            [[drives]]
            path = "/data/a.img"
            rootfs = true

            [[pmems]]
            path = "/data/b.pmem"
            rootfs = true
        "#;
        let err = Config::parse(toml, "<test>").unwrap_err();
        assert!(matches!(err, ConfigError::MultipleRootfs));
    }
}
