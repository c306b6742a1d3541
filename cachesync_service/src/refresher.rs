//! Cache refreshers and the registry that resolves them by id.
//!
//! A [`CacheRefresher`] owns one local cache and knows how to apply the four kinds of refresh
//! operation to it. The [`CacheRefresherRegistry`] is how the catch-up loop finds the refresher
//! named by an instruction; a refresher failing or panicking never takes the loop down with it.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use cachesync_id::{EntityId, RefresherId};
use cachesync_instruction::{Payload, RefreshInstruction, RefreshOperation};
use parking_lot::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("refresher {refresher} does not support {operation}")]
    Unsupported {
        refresher: String,
        operation: &'static str,
    },

    #[error("invalid payload: {0}")]
    Payload(#[from] cachesync_instruction::Error),

    #[error("unexpected error: {0}")]
    Unexpected(#[from] anyhow::Error),
}

/// Applies refresh operations to one local cache.
///
/// Implementations must be idempotent, an instruction may be applied more than once.
pub trait CacheRefresher: std::fmt::Debug + Send + Sync + 'static {
    fn refresher_id(&self) -> RefresherId;

    /// Human readable name, used in logs.
    fn name(&self) -> &str;

    /// Drop or reload everything this refresher caches.
    fn refresh_all(&self) -> Result<(), RefreshError>;

    fn refresh(&self, payload: &Payload) -> Result<(), RefreshError>;

    fn refresh_by_ids(&self, ids: &[EntityId]) -> Result<(), RefreshError>;

    fn remove_by_ids(&self, ids: &[EntityId]) -> Result<(), RefreshError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no cache refresher registered with id {0}")]
    UnknownRefresher(RefresherId),

    #[error("cache refresher {name} ({refresher_id}) failed: {source}")]
    Refresh {
        refresher_id: RefresherId,
        name: String,
        #[source]
        source: RefreshError,
    },

    #[error("cache refresher {name} ({refresher_id}) panicked: {message}")]
    Panicked {
        refresher_id: RefresherId,
        name: String,
        message: String,
    },
}

#[derive(Debug, Default)]
pub struct CacheRefresherRegistry {
    refreshers: RwLock<HashMap<RefresherId, Arc<dyn CacheRefresher>>>,
}

impl CacheRefresherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a refresher under its own id, returning the one it replaces, if any.
    pub fn register(&self, refresher: Arc<dyn CacheRefresher>) -> Option<Arc<dyn CacheRefresher>> {
        self.refreshers
            .write()
            .insert(refresher.refresher_id(), refresher)
    }

    pub fn resolve(&self, refresher_id: RefresherId) -> Option<Arc<dyn CacheRefresher>> {
        self.refreshers.read().get(&refresher_id).cloned()
    }

    /// Every registered refresher, ordered by id.
    pub fn all(&self) -> Vec<Arc<dyn CacheRefresher>> {
        let mut all: Vec<_> = self.refreshers.read().values().cloned().collect();
        all.sort_by_key(|r| r.refresher_id());
        all
    }

    pub fn len(&self) -> usize {
        self.refreshers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply one instruction through the refresher it names.
    pub fn dispatch(&self, instruction: &RefreshInstruction) -> Result<(), DispatchError> {
        let refresher = self
            .resolve(instruction.refresher_id)
            .ok_or(DispatchError::UnknownRefresher(instruction.refresher_id))?;
        apply(refresher.as_ref(), &instruction.operation)
    }
}

/// Run `operation` against `refresher`, turning a panic into an error.
pub fn apply(
    refresher: &dyn CacheRefresher,
    operation: &RefreshOperation,
) -> Result<(), DispatchError> {
    let outcome = catch_unwind(AssertUnwindSafe(|| match operation {
        RefreshOperation::RefreshAll => refresher.refresh_all(),
        RefreshOperation::RefreshByPayload(payload) => refresher.refresh(payload),
        RefreshOperation::RefreshByIds(ids) => refresher.refresh_by_ids(ids),
        RefreshOperation::RemoveByIds(ids) => refresher.remove_by_ids(ids),
    }));

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(DispatchError::Refresh {
            refresher_id: refresher.refresher_id(),
            name: refresher.name().to_string(),
            source,
        }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(DispatchError::Panicked {
                refresher_id: refresher.refresher_id(),
                name: refresher.name().to_string(),
                message,
            })
        }
    }
}
