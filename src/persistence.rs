use std::path::{Path, PathBuf};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Failed to load {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("Failed to save {path}: {reason}")]
    Save { path: String, reason: String },
}

pub type PersistResult<T> = Result<T, PersistError>;

/// A JSON document on disk, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_error(&self, reason: impl ToString) -> PersistError {
        PersistError::Load {
            path: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    fn save_error(&self, reason: impl ToString) -> PersistError {
        PersistError::Save {
            path: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Reads the document, `None` when the file does not exist yet.
    pub async fn load<T: DeserializeOwned>(&self) -> PersistResult<Option<T>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No snapshot on disk, starting empty");
                return Ok(None);
            }
            Err(e) => return Err(self.load_error(e)),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| self.load_error(e))
    }

    /// Writes to a sibling temporary file, then renames it over the target.
    pub async fn save<T: Serialize>(&self, value: &T) -> PersistResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.save_error(e))?;
        }

        let json = serde_json::to_vec_pretty(value).map_err(|e| self.save_error(e))?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, json)
            .await
            .map_err(|e| self.save_error(e))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| self.save_error(e))?;

        debug!(path = %self.path.display(), "Saved snapshot");
        Ok(())
    }
}
