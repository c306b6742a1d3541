//! CLI handling for the object store holding the instruction log (via CLI arguments and
//! environment variables).

use std::{fs, path::PathBuf, sync::Arc};

use object_store::{DynObjectStore, local::LocalFileSystem, memory::InMemory};
use tracing::{info, warn};

/// The directory prefix under which the instruction log is kept when none is given.
pub const DEFAULT_INSTRUCTION_LOG_PREFIX: &str = "cachesync";

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Unable to create database directory {path:?}: {source}")]
    CreatingDatabaseDirectory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Unable to create local store {path:?}: {source}")]
    CreateLocalFileSystem {
        path: PathBuf,
        source: object_store::Error,
    },

    #[error(
        "Specified {object_store:?} for the object store, required configuration missing for {missing}"
    )]
    MissingObjectStoreConfig {
        object_store: ObjectStoreType,
        missing: String,
    },
}

/// Object-store type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, clap::ValueEnum)]
pub enum ObjectStoreType {
    /// In-memory, only shared by the tasks of a single process.
    Memory,

    /// Filesystem, shared by every server that mounts the same directory.
    File,
}

impl ObjectStoreType {
    /// Map enum variant to static string, followed inverse of clap parsing rules.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
        }
    }
}

/// CLI config for the object store the instruction log lives in.
#[derive(Debug, Clone, clap::Parser)]
pub struct ObjectStoreConfig {
    /// Which object storage to use.
    ///
    /// Possible values (case insensitive):
    ///
    /// * memory: Effectively no object persistence. Only servers within the same process see
    ///   each other's instructions.
    /// * file: Stores the log in the local filesystem. Requires `--data-dir`. Point every server
    ///   of the farm at the same (shared) directory.
    #[clap(
        value_enum,
        long = "object-store",
        env = "CACHESYNC_OBJECT_STORE",
        ignore_case = true,
        action
    )]
    pub object_store: ObjectStoreType,

    /// Where to store files on disk. Only used with `--object-store file`.
    #[clap(long = "data-dir", env = "CACHESYNC_DB_DIR", action)]
    pub database_directory: Option<PathBuf>,

    /// Directory within the object store holding the instruction log. Servers only see each
    /// other's instructions when they use the same prefix.
    #[clap(
        long = "instruction-log-prefix",
        env = "CACHESYNC_INSTRUCTION_LOG_PREFIX",
        default_value = DEFAULT_INSTRUCTION_LOG_PREFIX,
        action
    )]
    pub instruction_log_prefix: String,
}

impl ObjectStoreConfig {
    /// Create a new instance for the given directory with the file object store.
    pub fn new(database_directory: Option<PathBuf>) -> Self {
        Self {
            object_store: ObjectStoreType::File,
            database_directory,
            instruction_log_prefix: DEFAULT_INSTRUCTION_LOG_PREFIX.to_string(),
        }
    }

    /// Create a new [`DynObjectStore`] from this config.
    pub fn make_object_store(&self) -> Result<Arc<DynObjectStore>, ParseError> {
        if let Some(data_dir) = &self.database_directory {
            if !matches!(&self.object_store, ObjectStoreType::File) {
                warn!(
                    ?data_dir,
                    object_store_type = ?self.object_store,
                    "--data-dir / `CACHESYNC_DB_DIR` ignored. It only affects 'file' object stores"
                );
            }
        }

        let object_store: Arc<DynObjectStore> = match &self.object_store {
            ObjectStoreType::Memory => {
                info!(object_store_type = "Memory", "Object Store");
                Arc::new(InMemory::new())
            }
            ObjectStoreType::File => self.new_local_file_system()?,
        };

        Ok(object_store)
    }

    fn new_local_file_system(&self) -> Result<Arc<LocalFileSystem>, ParseError> {
        match self.database_directory.as_ref() {
            Some(db_dir) => {
                info!(?db_dir, object_store_type = "Directory", "Object Store");
                fs::create_dir_all(db_dir).map_err(|source| {
                    ParseError::CreatingDatabaseDirectory {
                        path: db_dir.clone(),
                        source,
                    }
                })?;

                let store = LocalFileSystem::new_with_prefix(db_dir)
                    .map_err(|source| ParseError::CreateLocalFileSystem {
                        path: db_dir.clone(),
                        source,
                    })?
                    // Clean up intermediate directories automatically.
                    .with_automatic_cleanup(true);
                Ok(Arc::new(store))
            }
            None => Err(ParseError::MissingObjectStoreConfig {
                object_store: ObjectStoreType::File,
                missing: "data-dir".to_string(),
            }),
        }
    }
}
