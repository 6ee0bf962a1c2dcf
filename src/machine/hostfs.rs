//! File system capability delegating to a directory on the host.
//!
//! User programs see a flat namespace: names with path separators are
//! rejected so a program can never escape the root directory.

use super::{FileSystem, IoError, OpenFile};
use crate::sync::Lock;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// A [`FileSystem`] rooted at a host directory.
pub struct HostFileSystem {
    root: PathBuf,
}

impl HostFileSystem {
    /// Serve files from `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
            return None;
        }
        Some(self.root.join(name))
    }
}

impl FileSystem for HostFileSystem {
    fn open(&self, name: &str, create: bool) -> Option<Arc<dyn OpenFile>> {
        let path = self.resolve(name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(create)
            .open(path)
            .ok()?;
        Some(Arc::new(HostOpenFile {
            name: name.to_string(),
            file: Lock::new(file),
        }))
    }

    fn remove(&self, name: &str) -> bool {
        match self.resolve(name) {
            Some(path) => std::fs::remove_file(path).is_ok(),
            None => false,
        }
    }
}

struct HostOpenFile {
    name: String,
    file: Lock<std::fs::File>,
}

impl OpenFile for HostOpenFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, IoError> {
        self.file.lock().read(buf).map_err(|_| IoError::Device)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, IoError> {
        self.file.lock().write(buf).map_err(|_| IoError::Device)
    }

    fn seek(&self, pos: usize) {
        let _ = self.file.lock().seek(SeekFrom::Start(pos as u64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::distributions::Alphanumeric;
    use rand::{thread_rng, Rng};

    fn scratch_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "nachos-fs-{}",
            thread_rng()
                .sample_iter(&Alphanumeric)
                .take(8)
                .map(char::from)
                .collect::<String>()
        ));
        std::fs::create_dir(&dir).expect("failed to create scratch dir");
        dir
    }

    #[test]
    fn create_write_reopen_read_remove() {
        let dir = scratch_dir();
        let fs = HostFileSystem::new(&dir);

        let f = fs.open("f", true).unwrap();
        assert_eq!(f.write(b"abcdef"), Ok(6));
        drop(f);

        let f = fs.open("f", false).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(f.read(&mut buf), Ok(6));
        assert_eq!(&buf, b"abcdef");

        f.seek(2);
        let mut buf = [0u8; 2];
        assert_eq!(f.read(&mut buf), Ok(2));
        assert_eq!(&buf, b"cd");
        drop(f);

        assert!(fs.remove("f"));
        assert!(fs.open("f", false).is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rejects_path_escapes() {
        let dir = scratch_dir();
        let fs = HostFileSystem::new(&dir);
        assert!(fs.open("../evil", true).is_none());
        assert!(fs.open("a/b", true).is_none());
        assert!(!fs.remove(".."));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
