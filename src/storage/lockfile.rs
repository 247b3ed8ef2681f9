//! Process lock guarding the data directory so two supervisor instances
//! never open the same sled database concurrently.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = ".mushpi.lock";

pub struct ProcessLock {
    lock_path: PathBuf,
    owned: bool,
}

impl ProcessLock {
    /// Acquire the lock in `data_dir`, creating the directory if needed.
    /// Removes a stale lock left by a process that is no longer running.
    pub fn acquire(data_dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(data_dir)?;
        let lock_path = data_dir.join(LOCK_FILE_NAME);

        if let Some(existing_pid) = Self::check_existing_lock(&lock_path)? {
            if is_process_running(existing_pid) {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    format!(
                        "data directory {} is locked by running process {}",
                        data_dir.display(),
                        existing_pid
                    ),
                ));
            }
            tracing::warn!(pid = existing_pid, "removing stale lock file");
            fs::remove_file(&lock_path)?;
        }

        let mut file = fs::File::create(&lock_path)?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;

        Ok(Self {
            lock_path,
            owned: true,
        })
    }

    fn check_existing_lock(lock_path: &Path) -> std::io::Result<Option<u32>> {
        match fs::read_to_string(lock_path) {
            Ok(contents) => Ok(contents.trim().parse::<u32>().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn release(&mut self) {
        if self.owned {
            let _ = fs::remove_file(&self.lock_path);
            self.owned = false;
        }
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{pid}/cmdline")) {
        Ok(cmdline) => cmdline.contains("mushpi"),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_lock_file() {
        let dir = tempdir().unwrap();
        let _lock = ProcessLock::acquire(dir.path()).unwrap();
        assert!(dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn drop_releases_lock_file() {
        let dir = tempdir().unwrap();
        {
            let _lock = ProcessLock::acquire(dir.path()).unwrap();
            assert!(dir.path().join(LOCK_FILE_NAME).exists());
        }
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn stale_lock_with_unknown_pid_is_removed() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(LOCK_FILE_NAME), "999999999").unwrap();
        let _lock = ProcessLock::acquire(dir.path()).unwrap();
        let contents = fs::read_to_string(dir.path().join(LOCK_FILE_NAME)).unwrap();
        assert_eq!(contents, std::process::id().to_string());
    }
}
