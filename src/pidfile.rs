//! Single-instance enforcement via an advisory-locked pidfile.
//!
//! Mode 0600, content is the decimal pid followed by a newline, held for
//! the process lifetime under an exclusive advisory lock so a second
//! instance fails fast with a clear message instead of silently
//! double-running.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

#[derive(Debug, thiserror::Error)]
pub enum PidfileError {
    #[error("another instance is already running (pidfile {0} is locked)")]
    AlreadyRunning(PathBuf),
    #[error("failed to open pidfile {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write pidfile {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A held pidfile lock. Unlinks the file when dropped.
pub struct Pidfile {
    path: PathBuf,
    file: File,
}

impl Pidfile {
    pub fn acquire(path: &Path) -> Result<Self, PidfileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(path)
            .map_err(|source| PidfileError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        file.try_lock_exclusive()
            .map_err(|_| PidfileError::AlreadyRunning(path.to_path_buf()))?;

        file.set_len(0).map_err(|source| PidfileError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        file.seek(SeekFrom::Start(0)).ok();
        writeln!(file, "{}", std::process::id()).map_err(|source| PidfileError::Write {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    #[cfg(test)]
    fn read_pid(&mut self) -> u32 {
        let mut contents = String::new();
        self.file.seek(SeekFrom::Start(0)).unwrap();
        self.file.read_to_string(&mut contents).unwrap();
        contents.trim().parse().unwrap()
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
trait OpenOptionsExt {
    fn mode(&mut self, mode: u32) -> &mut Self;
}

#[cfg(unix)]
impl OpenOptionsExt for OpenOptions {
    fn mode(&mut self, mode: u32) -> &mut Self {
        std::os::unix::fs::OpenOptionsExt::mode(self, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_current_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icmond.lck");
        let mut pidfile = Pidfile::acquire(&path).unwrap();
        assert_eq!(pidfile.read_pid(), std::process::id());
    }

    #[test]
    fn second_acquire_fails_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icmond.lck");
        let _first = Pidfile::acquire(&path).unwrap();
        assert!(matches!(
            Pidfile::acquire(&path),
            Err(PidfileError::AlreadyRunning(_))
        ));
    }

    #[test]
    fn drop_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icmond.lck");
        {
            let _pidfile = Pidfile::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
