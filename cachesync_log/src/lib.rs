//! Storage for the shared cache instruction log.
//!
//! The log is the only channel between the servers of a farm. Every server appends the
//! instructions produced by its local mutations and polls for rows appended by the others. The
//! [`InstructionLog`] trait is the boundary the sync service talks to; two implementations are
//! provided:
//!
//! * [`memory::InMemoryInstructionLog`], for a single process and for tests;
//! * [`object_store::ObjectStoreInstructionLog`], which keeps one object per row in any object
//!   store and assigns ids with create-only puts, so that any number of processes can share one
//!   bucket or directory.

pub mod memory;
pub mod object_store;
pub mod serialize;

use std::fmt::Debug;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use cachesync_id::InstructionId;
use cachesync_instruction::{InstructionBatchRecord, NewInstructionBatch};
use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object store error: {0}")]
    ObjectStore(#[from] ::object_store::Error),

    #[error("instruction batch encoding error: {0}")]
    Serialize(#[from] serialize::Error),

    #[error("could not assign an instruction id after {attempts} attempts (last tried {last_tried})")]
    IdContention {
        attempts: usize,
        last_tried: InstructionId,
    },

    #[error("instruction id space exhausted")]
    IdOverflow,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Which rows [`InstructionLog::delete_older_than`] may remove.
///
/// A row is deleted when its id is strictly below `below_id` and, if `older_than` is set, its
/// timestamp is strictly before `older_than`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PruneThreshold {
    pub below_id: InstructionId,
    pub older_than: Option<DateTime<Utc>>,
}

impl PruneThreshold {
    pub fn matches(&self, record: &InstructionBatchRecord) -> bool {
        record.id < self.below_id
            && self
                .older_than
                .is_none_or(|older_than| record.utc_timestamp < older_than)
    }
}

/// The append-only instruction log shared by all servers of a farm.
///
/// Implementations assign ids atomically: concurrent inserts, from this process or from others
/// sharing the same storage, never receive the same id, and ids are never reused, including
/// after rows were deleted. To guarantee the latter, implementations never delete the row
/// holding the current maximum id.
#[async_trait]
pub trait InstructionLog: Debug + Send + Sync + 'static {
    /// Append the batches in order, returning the id assigned to each.
    async fn insert(&self, batches: Vec<NewInstructionBatch>) -> Result<Vec<InstructionId>>;

    /// At most `page_size` rows with an id greater than `id`, in ascending id order.
    async fn query_after(
        &self,
        id: InstructionId,
        page_size: NonZeroUsize,
    ) -> Result<Vec<InstructionBatchRecord>>;

    /// Number of rows with an id greater than `id`.
    async fn count_after(&self, id: InstructionId) -> Result<u64>;

    /// The greatest id in the log, or [`InstructionId::NONE`] when it is empty.
    async fn max_id(&self) -> Result<InstructionId>;

    /// Whether the row with the given id is still in the log.
    async fn contains(&self, id: InstructionId) -> Result<bool>;

    /// Delete the rows matched by `threshold`, except the newest row. Returns how many rows
    /// were deleted.
    async fn delete_older_than(&self, threshold: PruneThreshold) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachesync_instruction::SerializedInstructions;
    use chrono::TimeZone;

    fn record(id: u64, secs: i64) -> InstructionBatchRecord {
        InstructionBatchRecord {
            id: InstructionId::new(id),
            utc_timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            origin_identity: "a".into(),
            instruction_count: 0,
            instructions: SerializedInstructions::from_raw("[]"),
        }
    }

    #[test]
    fn threshold_by_id_only() {
        let threshold = PruneThreshold {
            below_id: InstructionId::new(5),
            older_than: None,
        };
        assert!(threshold.matches(&record(4, 1_000)));
        assert!(!threshold.matches(&record(5, 0)));
    }

    #[test]
    fn threshold_by_id_and_age() {
        let threshold = PruneThreshold {
            below_id: InstructionId::new(5),
            older_than: Some(Utc.timestamp_opt(100, 0).unwrap()),
        };
        assert!(threshold.matches(&record(1, 99)));
        assert!(!threshold.matches(&record(1, 100)));
        assert!(!threshold.matches(&record(6, 0)));
    }
}
