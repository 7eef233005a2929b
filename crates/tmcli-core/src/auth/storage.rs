//! Credential file storage.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::auth::credentials::Credentials;

/// Directory under the home directory holding tmcli state.
pub const CREDENTIALS_DIR: &str = ".tmcli";

/// File name of the device-flow credential cache.
pub const CREDENTIALS_FILE: &str = "dingtalk_oauth_creds.json";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error(
        "Failed to cache credentials: permission denied. Current user has no permission to access `{}`. Please check permissions.",
        path.display()
    )]
    PermissionDenied { path: PathBuf },
    #[error("Failed to access credentials at `{}`: {source}. Please check permissions.", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed credential file `{}`: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Could not determine the home directory")]
    NoHomeDir,
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::PermissionDenied {
            StorageError::PermissionDenied {
                path: path.to_path_buf(),
            }
        } else {
            StorageError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Reads and writes one credential file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.tmcli/dingtalk_oauth_creds.json`
    pub fn default_location() -> Result<Self, StorageError> {
        let home = dirs::home_dir().ok_or(StorageError::NoHomeDir)?;
        Ok(Self::new(home.join(CREDENTIALS_DIR).join(CREDENTIALS_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the file. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<Credentials>, StorageError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };
        let credentials = serde_json::from_str(&content).map_err(|source| StorageError::Malformed {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(credentials))
    }

    /// Writes the file atomically: a temp file in the same directory is
    /// written, restricted to the owner, then renamed over the target.
    pub fn save(&self, credentials: &Credentials) -> Result<(), StorageError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;

        let content = serde_json::to_string_pretty(credentials).map_err(|source| StorageError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StorageError::io(dir, e))?;
        tmp.write_all(content.as_bytes())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| StorageError::io(tmp.path(), e))?;
        ensure_private_file(tmp.path())?;
        tmp.persist(&self.path)
            .map_err(|e| StorageError::io(&self.path, e.error))?;

        tracing::debug!("Saved credentials to {}", self.path.display());
        Ok(())
    }

    /// Removes the file. A missing file is not an error.
    pub fn delete(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!("Deleted credentials at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&self.path, e)),
        }
    }

    /// Modification time of the file, `None` when absent.
    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

/// Ensure file has private permissions (0o600)
fn ensure_private_file(path: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| StorageError::io(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
