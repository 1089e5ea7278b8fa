//! Privilege-separated read of a user's `~/.ssh/auth_id`.
//!
//! The verify process runs as the unprivileged opksshuser and cannot read
//! other users' home directories, so it re-invokes this binary as
//! `sudo -n <bin> readhome <user>` under a single NOPASSWD sudoers rule.
//! `readhome` is the entire elevated surface: one fixed path per username,
//! no symlink traversal out of the home.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use thiserror::Error;
use uzers::os::unix::UserExt;

use super::HomePolicyLoader;

/// Deadline for the sudo round trip.
const READHOME_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ReadHomeError {
    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("no such user: {0}")]
    NoSuchUser(String),

    #[error("refusing to follow symlinked policy file for {0}")]
    Symlink(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validate that a name is a plain account name before it goes anywhere
/// near a path or a command line.
fn valid_username(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_lowercase() || c == '_')
            .unwrap_or(false)
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// The elevated side: resolve the user's home and read `.ssh/auth_id`.
pub fn read_home_policy(username: &str) -> Result<String, ReadHomeError> {
    if !valid_username(username) {
        return Err(ReadHomeError::InvalidUsername(username.to_string()));
    }
    let user = uzers::get_user_by_name(username)
        .ok_or_else(|| ReadHomeError::NoSuchUser(username.to_string()))?;
    let path: PathBuf = user.home_dir().join(".ssh").join("auth_id");

    let meta = std::fs::symlink_metadata(&path)?;
    if meta.file_type().is_symlink() {
        return Err(ReadHomeError::Symlink(username.to_string()));
    }

    Ok(std::fs::read_to_string(&path)?)
}

/// The unprivileged side: shell out through sudo with a bounded deadline.
pub struct SudoHomeLoader {
    binary: PathBuf,
}

impl SudoHomeLoader {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Loader pointing at the currently running binary.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl HomePolicyLoader for SudoHomeLoader {
    fn read(&self, principal: &str) -> std::io::Result<String> {
        if !valid_username(principal) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid principal name {principal:?}"),
            ));
        }

        let mut child = Command::new("sudo")
            .arg("-n")
            .arg("--")
            .arg(&self.binary)
            .arg("readhome")
            .arg(principal)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let mut stdout = child.stdout.take().expect("stdout piped");
        let (tx, rx) = mpsc::channel();
        let reader = std::thread::spawn(move || {
            let mut buf = String::new();
            let read = stdout.read_to_string(&mut buf).map(|_| buf);
            let _ = tx.send(read);
        });

        match rx.recv_timeout(READHOME_TIMEOUT) {
            Ok(read) => {
                let output = read?;
                let status = child.wait()?;
                let _ = reader.join();
                if status.success() {
                    Ok(output)
                } else {
                    Err(std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        format!("readhome helper exited with {status}"),
                    ))
                }
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "readhome helper deadline exceeded",
                ))
            }
        }
    }
}
