//! Persistent list of instances launched by the fleet tooling.
//!
//! The registry is a pretty-printed JSON array. A record stays in the file
//! until a destroy of its instance has been confirmed. Every write replaces
//! the whole file through a temporary sibling and a rename.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registry file used when no path is configured.
pub const DEFAULT_REGISTRY_FILE: &str = "active_instances.json";

/// One launched instance.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct InstanceRecord {
    /// Position of the launch within its batch.
    pub index: usize,
    /// Marketplace instance id.
    pub instance_id: String,
    /// Offer the instance was rented from.
    pub offer_id: String,
    /// GPU model of the offer.
    pub gpu_name: String,
    /// Hourly price at launch time.
    pub price_per_hour: f64,
    /// Launch time.
    pub created_at: DateTime<Utc>,
}

/// Errors raised while reading or writing the registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the file is not a JSON array of records.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Path that could not be parsed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the registry path has no file name.
    #[error("registry path {path} is missing a file name")]
    InvalidPath {
        /// Offending path.
        path: Utf8PathBuf,
    },
}

/// JSON-file registry of active instances.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRegistry {
    path: Utf8PathBuf,
}

impl Default for InstanceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_FILE)
    }
}

impl InstanceRegistry {
    /// Creates a registry stored at `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the registry file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Reads every record, or `None` when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] when the file cannot be read and
    /// [`RegistryError::Parse`] when it is not a list of records.
    pub fn load(&self) -> Result<Option<Vec<InstanceRecord>>, RegistryError> {
        let (opened, file_name) = self.open_parent()?;
        let Some(dir) = opened else {
            return Ok(None);
        };
        let contents = match dir.read_to_string(file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(&err)),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|err| RegistryError::Parse {
                path: self.path.clone(),
                message: err.to_string(),
            })
    }

    /// Adds records after those already stored, creating the file if needed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the existing file cannot be read or
    /// the new contents cannot be written.
    pub fn append(&self, records: &[InstanceRecord]) -> Result<(), RegistryError> {
        let mut all = self.load()?.unwrap_or_default();
        all.extend_from_slice(records);
        self.save(&all)
    }

    /// Replaces the file contents with `records`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] when the file cannot be written.
    pub fn save(&self, records: &[InstanceRecord]) -> Result<(), RegistryError> {
        let parent = self.parent();
        Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| {
            RegistryError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        let (opened, file_name) = self.open_parent()?;
        let Some(dir) = opened else {
            return Err(RegistryError::Io {
                path: parent.to_path_buf(),
                message: String::from("directory vanished while saving"),
            });
        };

        let rendered =
            serde_json::to_string_pretty(records).map_err(|err| RegistryError::Parse {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        let temp_name = format!(".{file_name}.tmp");
        dir.write(&temp_name, format!("{rendered}\n"))
            .map_err(|err| self.io_error(&err))?;
        dir.rename(&temp_name, &dir, file_name)
            .map_err(|err| self.io_error(&err))
    }

    /// Deletes the file. Returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Io`] when the file exists but cannot be
    /// removed.
    pub fn remove(&self) -> Result<bool, RegistryError> {
        let (opened, file_name) = self.open_parent()?;
        let Some(dir) = opened else {
            return Ok(false);
        };
        match dir.remove_file(file_name) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(self.io_error(&err)),
        }
    }

    fn parent(&self) -> &Utf8Path {
        match self.path.parent() {
            Some(parent) if !parent.as_str().is_empty() => parent,
            _ => Utf8Path::new("."),
        }
    }

    fn open_parent(&self) -> Result<(Option<Dir>, &str), RegistryError> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| RegistryError::InvalidPath {
                path: self.path.clone(),
            })?;
        let parent = self.parent();
        match Dir::open_ambient_dir(parent, ambient_authority()) {
            Ok(dir) => Ok((Some(dir), file_name)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok((None, file_name)),
            Err(err) => Err(RegistryError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            }),
        }
    }

    fn io_error(&self, err: &io::Error) -> RegistryError {
        RegistryError::Io {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}
