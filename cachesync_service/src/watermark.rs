//! Where a server keeps the id of the last record it applied between restarts.
//!
//! The watermark is local to one server and only an optimisation: when it is missing or
//! unreadable the server cold boots and rebuilds it from the log.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cachesync_id::InstructionId;
use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read watermark file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write watermark file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait WatermarkStore: std::fmt::Debug + Send + Sync + 'static {
    /// The saved watermark, `None` if this server never synced.
    async fn load(&self) -> Result<Option<InstructionId>>;

    async fn save(&self, last_id: InstructionId) -> Result<()>;
}

/// Keeps the watermark as a decimal number in a text file.
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn load(&self) -> Result<Option<InstructionId>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(Error::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        match content.parse::<InstructionId>() {
            Ok(id) => Ok(Some(id)),
            Err(error) => {
                warn!(%error, path = ?self.path, "ignoring unreadable watermark file");
                Ok(None)
            }
        }
    }

    async fn save(&self, last_id: InstructionId) -> Result<()> {
        let write_err = |source: std::io::Error| Error::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        // write then rename so a crash never leaves a half written file behind
        let temp = self.temp_path();
        tokio::fs::write(&temp, last_id.to_string())
            .await
            .map_err(write_err)?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(write_err)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryWatermarkStore {
    last_id: Mutex<Option<InstructionId>>,
}

impl InMemoryWatermarkStore {
    pub fn new(last_id: Option<InstructionId>) -> Self {
        Self {
            last_id: Mutex::new(last_id),
        }
    }
}

#[async_trait]
impl WatermarkStore for InMemoryWatermarkStore {
    async fn load(&self) -> Result<Option<InstructionId>> {
        Ok(*self.last_id.lock())
    }

    async fn save(&self, last_id: InstructionId) -> Result<()> {
        *self.last_id.lock() = Some(last_id);
        Ok(())
    }
}
