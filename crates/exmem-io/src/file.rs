//! Disk files with positioned synchronous I/O.

use exmem_common::config::DiskSpec;
use exmem_common::{ExmemError, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// A sized random-access byte device backing one disk of the block
/// manager.
///
/// Reads and writes use positioned I/O (`pread`/`pwrite`) so that the
/// per-disk worker thread and foreground threads never contend on a
/// shared file cursor.
pub struct DiskFile {
    /// The open file handle.
    file: File,
    /// Index of this disk in the configuration.
    index: u32,
    /// Configured capacity in bytes.
    capacity: u64,
    /// Path to the backing file.
    path: PathBuf,
}

impl DiskFile {
    /// Opens (or creates) the backing file and extends it to the
    /// configured capacity.
    pub fn open(index: u32, spec: &DiskSpec) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true);

        #[cfg(target_os = "linux")]
        if spec.direct {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options.open(&spec.path)?;
        if file.metadata()?.len() < spec.size {
            file.set_len(spec.size)?;
        }

        Ok(Self {
            file,
            index,
            capacity: spec.size,
            path: spec.path.clone(),
        })
    }

    /// Returns the disk index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the configured capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads `buf.len()` bytes at `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|source| ExmemError::IoFailed {
                disk: self.index,
                offset,
                length: buf.len(),
                source,
            })
    }

    /// Writes `buf.len()` bytes at `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|source| ExmemError::IoFailed {
                disk: self.index,
                offset,
                length: buf.len(),
                source,
            })
    }

    /// Flushes OS buffers for this file.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exmem_common::config::DiskDriver;
    use tempfile::tempdir;

    fn spec(dir: &Path, size: u64) -> DiskSpec {
        DiskSpec {
            path: dir.join("disk0"),
            size,
            driver: DiskDriver::Syscall,
            direct: false,
        }
    }

    #[test]
    fn test_open_extends_to_capacity() {
        let dir = tempdir().unwrap();
        let file = DiskFile::open(0, &spec(dir.path(), 1 << 20)).unwrap();
        assert_eq!(file.capacity(), 1 << 20);
        assert_eq!(std::fs::metadata(file.path()).unwrap().len(), 1 << 20);
    }

    #[test]
    fn test_positioned_write_read() {
        let dir = tempdir().unwrap();
        let file = DiskFile::open(3, &spec(dir.path(), 1 << 20)).unwrap();

        let data = vec![0xABu8; 4096];
        file.write_at(8192, &data).unwrap();

        let mut back = vec![0u8; 4096];
        file.read_at(8192, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_read_failure_carries_location() {
        let dir = tempdir().unwrap();
        let file = DiskFile::open(7, &spec(dir.path(), 4096)).unwrap();

        // Reading past EOF fails with a located error.
        let mut buf = vec![0u8; 4096];
        let err = file.read_at(1 << 30, &mut buf).unwrap_err();
        match err {
            ExmemError::IoFailed {
                disk,
                offset,
                length,
                ..
            } => {
                assert_eq!(disk, 7);
                assert_eq!(offset, 1 << 30);
                assert_eq!(length, 4096);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_reopen_preserves_contents() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), 1 << 16);

        {
            let file = DiskFile::open(0, &spec).unwrap();
            file.write_at(0, &[0xEE; 512]).unwrap();
            file.sync().unwrap();
        }

        let file = DiskFile::open(0, &spec).unwrap();
        let mut back = [0u8; 512];
        file.read_at(0, &mut back).unwrap();
        assert_eq!(back, [0xEE; 512]);
    }
}
