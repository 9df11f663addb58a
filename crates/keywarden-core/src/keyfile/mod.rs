//! Durable key file mirror.
//!
//! Workloads that cannot take the key from the environment read it from a
//! file instead. Every write here is staged: the existing file is backed up,
//! the new value goes to a temp file that is flushed and read back, and only
//! a byte-identical temp file is renamed into place. A failure at any step
//! leaves the previous file untouched.

use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{FileOwner, ManagedKeySection};

const DEFAULT_MODE: u32 = 0o600;

/// Key file write failures.
#[derive(Debug, Error)]
pub enum KeyFileError {
    /// A filesystem step failed.
    #[error("key file i/o failed: {0}")]
    Io(#[from] std::io::Error),

    /// The staged file read back different bytes than were written.
    #[error("key file verification failed: staged bytes do not match")]
    VerifyMismatch,

    /// Changing ownership failed.
    #[error("key file chown failed: {0}")]
    Chown(#[from] nix::Error),
}

/// Mirrors the managed key to a file.
pub struct KeyFileMirror {
    path: PathBuf,
    mode: u32,
    owner: Option<FileOwner>,
    #[cfg(test)]
    fail_before_rename: std::sync::atomic::AtomicBool,
}

impl KeyFileMirror {
    /// Creates a mirror writing to `path`.
    #[must_use]
    pub fn new(path: PathBuf, mode: Option<u32>, owner: Option<FileOwner>) -> Self {
        Self {
            path,
            mode: mode.unwrap_or(DEFAULT_MODE),
            owner,
            #[cfg(test)]
            fail_before_rename: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Builds a mirror from config, or `None` when no file path is set.
    #[must_use]
    pub fn from_config(section: &ManagedKeySection) -> Option<Self> {
        section
            .file_path
            .clone()
            .map(|path| Self::new(path, section.file_mode, section.file_owner))
    }

    /// Target path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `key` durably.
    ///
    /// # Errors
    ///
    /// Any failed step returns an error with the previous file intact.
    pub fn write(&self, key: &SecretString) -> Result<(), KeyFileError> {
        self.backup_existing()?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut staged = NamedTempFile::new_in(parent)?;
        staged.write_all(key.expose_secret().as_bytes())?;
        staged.as_file().sync_all()?;

        // Read back what the filesystem actually holds.
        let mut readback = Vec::new();
        let mut reopened = std::fs::File::open(staged.path())?;
        reopened.read_to_end(&mut readback)?;
        if readback != key.expose_secret().as_bytes() {
            return Err(KeyFileError::VerifyMismatch);
        }

        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(self.mode))?;
        if let Some(owner) = self.owner {
            nix::unistd::chown(
                staged.path(),
                Some(nix::unistd::Uid::from_raw(owner.uid)),
                Some(nix::unistd::Gid::from_raw(owner.gid)),
            )?;
        }

        #[cfg(test)]
        if self
            .fail_before_rename
            .load(std::sync::atomic::Ordering::SeqCst)
        {
            return Err(KeyFileError::Io(std::io::Error::other(
                "injected failure before rename",
            )));
        }

        staged
            .persist(&self.path)
            .map_err(|err| KeyFileError::Io(err.error))?;
        info!(path = %self.path.display(), "key file updated");
        Ok(())
    }

    /// Repairs the mirror so it holds `known_good`.
    ///
    /// A target already holding the value is left alone. A missing or
    /// corrupt target is restored from the backup when the backup holds the
    /// value, otherwise rewritten from `known_good`.
    ///
    /// # Errors
    ///
    /// Returns the underlying write failure.
    pub fn recover(&self, known_good: &SecretString) -> Result<(), KeyFileError> {
        let expected = known_good.expose_secret().as_bytes();
        if matches!(std::fs::read(&self.path), Ok(content) if content == expected) {
            return Ok(());
        }
        warn!(path = %self.path.display(), "key file missing or corrupt; recovering");

        let backup = self.backup_path();
        if matches!(std::fs::read(&backup), Ok(content) if content == expected) {
            std::fs::copy(&backup, &self.path)?;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(self.mode))?;
            info!(path = %self.path.display(), "key file restored from backup");
            return Ok(());
        }
        self.write(known_good)
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    fn backup_existing(&self) -> Result<(), KeyFileError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) if meta.len() > 0 => {
                std::fs::copy(&self.path, self.backup_path())?;
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
