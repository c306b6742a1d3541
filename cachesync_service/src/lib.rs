//! Keeps the in-process caches of a farm of servers coherent through the shared instruction log.
//!
//! [`CacheInstructionService`] holds the policy: when a server must cold boot, how instructions
//! are appended, and the catch-up loop that replays other servers' instructions through the
//! [`CacheRefresherRegistry`] and prunes the log. [`CacheSync`] drives it for one server: it owns
//! the watermark, runs the periodic background cycle and shuts down cleanly.

pub mod identity;
pub mod refresher;
pub mod results;
pub mod retention;
pub mod role;
pub mod service;
pub mod sync;
pub mod time;
pub mod watermark;

pub use identity::LocalIdentity;
pub use refresher::{CacheRefresher, CacheRefresherRegistry, DispatchError, RefreshError};
pub use results::{InitializationResult, ProcessInstructionsResult};
pub use retention::RetentionPolicy;
pub use role::{ServerRole, ServerRoleProvider};
pub use service::{CacheInstructionConfig, CacheInstructionService, ServiceState};
pub use sync::{CacheSync, CacheSyncArgs, CacheSyncConfig};
pub use time::{MockProvider, SystemProvider, TimeProvider};
pub use watermark::{FileWatermarkStore, InMemoryWatermarkStore, WatermarkStore};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("instruction log error: {0}")]
    Log(#[from] cachesync_log::Error),

    #[error("invalid instructions: {0}")]
    Instruction(#[from] cachesync_instruction::Error),

    #[error("watermark error: {0}")]
    Watermark(#[from] watermark::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
