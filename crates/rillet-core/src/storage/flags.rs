use crate::Result;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

pub const NO_READ_FILE: &str = "noread";
pub const NO_WRITE_FILE: &str = "nowrite";

/// Readable / writable switches of a partition, persisted as marker files in
/// the partition directory. A present marker means the flag is off.
#[derive(Debug)]
pub struct PartitionFlags {
    dir: PathBuf,
    readable: bool,
    writable: bool,
}

impl PartitionFlags {
    pub fn load(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            readable: !dir.join(NO_READ_FILE).exists(),
            writable: !dir.join(NO_WRITE_FILE).exists(),
        }
    }

    pub fn readable(&self) -> bool {
        self.readable
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn set_readable(&mut self, readable: bool) -> Result<()> {
        set_marker(&self.dir.join(NO_READ_FILE), !readable)?;
        self.readable = readable;
        Ok(())
    }

    pub fn set_writable(&mut self, writable: bool) -> Result<()> {
        set_marker(&self.dir.join(NO_WRITE_FILE), !writable)?;
        self.writable = writable;
        Ok(())
    }
}

fn set_marker(path: &Path, present: bool) -> Result<()> {
    if present {
        OpenOptions::new().create(true).write(true).open(path)?;
    } else if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_default_on() {
        let dir = tempfile::tempdir().unwrap();
        let flags = PartitionFlags::load(dir.path());
        assert!(flags.readable());
        assert!(flags.writable());
    }

    #[test]
    fn test_flags_persist_as_markers() {
        let dir = tempfile::tempdir().unwrap();
        let mut flags = PartitionFlags::load(dir.path());

        flags.set_writable(false).unwrap();
        flags.set_readable(false).unwrap();
        assert!(dir.path().join(NO_WRITE_FILE).exists());
        assert!(dir.path().join(NO_READ_FILE).exists());

        let reloaded = PartitionFlags::load(dir.path());
        assert!(!reloaded.readable());
        assert!(!reloaded.writable());

        flags.set_writable(true).unwrap();
        flags.set_writable(true).unwrap();
        assert!(!dir.path().join(NO_WRITE_FILE).exists());
        assert!(PartitionFlags::load(dir.path()).writable());
    }
}
