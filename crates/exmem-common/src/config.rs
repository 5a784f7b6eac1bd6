//! Disk configuration for the block manager.
//!
//! The set of disks backing the block manager is described by a small
//! line-oriented configuration file. Each non-comment line has the form
//!
//! ```text
//! path=<file>,size=<bytes>,<driver>[,direct]
//! ```
//!
//! where `<bytes>` accepts `K`/`M`/`G`/`T` suffixes. The file path is
//! taken from the `DISKFILES` environment variable, falling back to
//! `./exmem.disks`.

use crate::error::{ExmemError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// I/O driver used for a configured disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiskDriver {
    /// Positioned pread/pwrite system calls.
    Syscall,
    /// Memory-mapped file, served by the same positioned-I/O path.
    Mmap,
}

/// One disk (file or raw partition) backing the block manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Path of the backing file.
    pub path: PathBuf,
    /// Capacity in bytes.
    pub size: u64,
    /// I/O driver.
    pub driver: DiskDriver,
    /// Bypass the OS page cache (O_DIRECT).
    pub direct: bool,
}

/// Full disk configuration: an ordered list of disks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// The configured disks, in striping order.
    pub disks: Vec<DiskSpec>,
}

impl DiskConfig {
    /// Environment variable naming the configuration file.
    pub const ENV_VAR: &'static str = "DISKFILES";

    /// Default configuration file path.
    pub const DEFAULT_PATH: &'static str = "./exmem.disks";

    /// Loads the configuration from `$DISKFILES` or the default path.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var_os(Self::ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_PATH));
        let text = std::fs::read_to_string(&path).map_err(|e| {
            ExmemError::BadConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    /// Parses configuration text. Errors carry 1-based line numbers.
    pub fn parse(text: &str) -> Result<Self> {
        let mut disks = Vec::new();

        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            disks.push(parse_line(line).map_err(|msg| {
                ExmemError::BadConfig(format!("line {}: {}", lineno + 1, msg))
            })?);
        }

        if disks.is_empty() {
            return Err(ExmemError::BadConfig("no disks configured".to_string()));
        }

        Ok(Self { disks })
    }

    /// Returns the number of configured disks.
    pub fn num_disks(&self) -> usize {
        self.disks.len()
    }

    /// Total capacity across all disks in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.disks.iter().map(|d| d.size).sum()
    }
}

fn parse_line(line: &str) -> std::result::Result<DiskSpec, String> {
    let mut path = None;
    let mut size = None;
    let mut driver = None;
    let mut direct = false;

    for field in line.split(',') {
        let field = field.trim();
        if let Some(value) = field.strip_prefix("path=") {
            path = Some(PathBuf::from(value));
        } else if let Some(value) = field.strip_prefix("size=") {
            size = Some(parse_size(value)?);
        } else if field == "direct" || field == "raw" {
            direct = true;
        } else {
            driver = Some(match field {
                "syscall" => DiskDriver::Syscall,
                "mmap" => DiskDriver::Mmap,
                other => return Err(format!("unknown driver '{}'", other)),
            });
        }
    }

    let path = path.ok_or_else(|| "missing path= field".to_string())?;
    let size = size.ok_or_else(|| "missing size= field".to_string())?;
    let driver = driver.ok_or_else(|| "missing driver field".to_string())?;
    if size == 0 {
        return Err("size must be non-zero".to_string());
    }

    Ok(DiskSpec {
        path,
        size,
        driver,
        direct,
    })
}

/// Parses a byte count with an optional K/M/G/T suffix (powers of 1024).
fn parse_size(text: &str) -> std::result::Result<u64, String> {
    let text = text.trim();
    let (digits, shift) = match text.chars().last() {
        Some('K') | Some('k') => (&text[..text.len() - 1], 10),
        Some('M') | Some('m') => (&text[..text.len() - 1], 20),
        Some('G') | Some('g') => (&text[..text.len() - 1], 30),
        Some('T') | Some('t') => (&text[..text.len() - 1], 40),
        _ => (text, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{}'", text))?;
    value
        .checked_shl(shift)
        .filter(|v| shift == 0 || *v >> shift == value)
        .ok_or_else(|| format!("size '{}' overflows", text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_disk() {
        let config = DiskConfig::parse("path=/tmp/disk0,size=64M,syscall\n").unwrap();
        assert_eq!(config.num_disks(), 1);
        assert_eq!(config.disks[0].path, PathBuf::from("/tmp/disk0"));
        assert_eq!(config.disks[0].size, 64 << 20);
        assert_eq!(config.disks[0].driver, DiskDriver::Syscall);
        assert!(!config.disks[0].direct);
    }

    #[test]
    fn test_parse_multiple_disks_and_total() {
        let text = "\
path=/tmp/a,size=1G,syscall
path=/tmp/b,size=512M,mmap
";
        let config = DiskConfig::parse(text).unwrap();
        assert_eq!(config.num_disks(), 2);
        assert_eq!(config.total_bytes(), (1u64 << 30) + (512 << 20));
    }

    #[test]
    fn test_parse_comments_and_blank_lines() {
        let text = "\
# primary scratch disk
path=/tmp/a,size=16M,syscall

# secondary
path=/tmp/b,size=16M,syscall
";
        let config = DiskConfig::parse(text).unwrap();
        assert_eq!(config.num_disks(), 2);
    }

    #[test]
    fn test_parse_direct_and_raw_flags() {
        let config =
            DiskConfig::parse("path=/tmp/a,size=1M,syscall,direct\npath=/dev/sdb1,size=1G,syscall,raw\n")
                .unwrap();
        assert!(config.disks[0].direct);
        assert!(config.disks[1].direct);
    }

    #[test]
    fn test_parse_unknown_driver_is_fatal() {
        let err = DiskConfig::parse("path=/tmp/a,size=1M,nvme\n").unwrap_err();
        match err {
            ExmemError::BadConfig(msg) => {
                assert!(msg.contains("line 1"));
                assert!(msg.contains("nvme"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_fields() {
        assert!(DiskConfig::parse("size=1M,syscall\n").is_err());
        assert!(DiskConfig::parse("path=/tmp/a,syscall\n").is_err());
        assert!(DiskConfig::parse("path=/tmp/a,size=1M\n").is_err());
    }

    #[test]
    fn test_parse_empty_config_is_error() {
        assert!(DiskConfig::parse("").is_err());
        assert!(DiskConfig::parse("# only comments\n").is_err());
    }

    #[test]
    fn test_parse_zero_size_is_error() {
        assert!(DiskConfig::parse("path=/tmp/a,size=0,syscall\n").is_err());
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("4K").unwrap(), 4096);
        assert_eq!(parse_size("2m").unwrap(), 2 << 20);
        assert_eq!(parse_size("3G").unwrap(), 3u64 << 30);
        assert_eq!(parse_size("1T").unwrap(), 1u64 << 40);
        assert!(parse_size("12Q").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_line_numbers_in_errors() {
        let text = "path=/tmp/a,size=1M,syscall\npath=/tmp/b,size=oops,syscall\n";
        let err = DiskConfig::parse(text).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let original = DiskConfig::parse("path=/tmp/a,size=8M,syscall,direct\n").unwrap();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: DiskConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
