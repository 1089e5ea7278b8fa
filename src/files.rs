//! Filesystem access behind a small trait.
//!
//! All file I/O in the crate goes through [`Fs`] so flows that touch disk
//! (login key material, policy files, the audit log) can run against an
//! in-memory backend in tests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait Fs: Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()>;

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Backend over the real filesystem. Appends open the file `O_APPEND` so
/// concurrent verify processes interleave whole lines.
#[derive(Debug, Default, Clone)]
pub struct RealFs;

impl Fs for RealFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        std::fs::write(path, data)
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(data)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }
}

/// In-memory backend for tests. Directories are implicit; modes are
/// recorded but not enforced.
#[derive(Debug, Default)]
pub struct MemFs {
    files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    modes: Mutex<HashMap<PathBuf, u32>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode_of(&self, path: &Path) -> Option<u32> {
        self.modes.lock().unwrap().get(path).copied()
    }
}

impl Fs for MemFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), data.to_vec());
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn create_dir_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn set_mode(&self, path: &Path, mode: u32) -> io::Result<()> {
        self.modes.lock().unwrap().insert(path.to_path_buf(), mode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memfs_read_write_roundtrip() {
        let fs = MemFs::new();
        let path = Path::new("/etc/opk/auth_id");
        fs.write(path, b"alice email u@test https://op.test/\n")
            .unwrap();
        assert!(fs.exists(path));
        assert_eq!(
            fs.read_to_string(path).unwrap(),
            "alice email u@test https://op.test/\n"
        );
    }

    #[test]
    fn test_memfs_append_accumulates() {
        let fs = MemFs::new();
        let path = Path::new("/var/log/opkssh.log");
        fs.append(path, b"one\n").unwrap();
        fs.append(path, b"two\n").unwrap();
        assert_eq!(fs.read_to_string(path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_memfs_missing_file_is_not_found() {
        let fs = MemFs::new();
        let err = fs.read(Path::new("/nope")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_memfs_records_modes() {
        let fs = MemFs::new();
        let path = Path::new("/etc/opk/auth_id");
        fs.write(path, b"").unwrap();
        fs.set_mode(path, 0o640).unwrap();
        assert_eq!(fs.mode_of(path), Some(0o640));
    }
}
