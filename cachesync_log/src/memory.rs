//! An instruction log held in process memory.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::ops::Bound;

use async_trait::async_trait;
use cachesync_id::InstructionId;
use cachesync_instruction::{InstructionBatchRecord, NewInstructionBatch};
use parking_lot::Mutex;

use crate::{Error, InstructionLog, PruneThreshold, Result};

#[derive(Debug, Default)]
struct Inner {
    last_assigned: InstructionId,
    records: BTreeMap<InstructionId, InstructionBatchRecord>,
}

/// An [`InstructionLog`] that only lives as long as the process.
///
/// Useful when every "server" runs in one process, as in tests, or as the log of a single server
/// that wants the same code path as a farm.
#[derive(Debug, Default)]
pub struct InMemoryInstructionLog {
    inner: Mutex<Inner>,
}

impl InMemoryInstructionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every row currently held, ascending.
    pub fn ids(&self) -> Vec<InstructionId> {
        self.inner.lock().records.keys().copied().collect()
    }
}

#[async_trait]
impl InstructionLog for InMemoryInstructionLog {
    async fn insert(&self, batches: Vec<NewInstructionBatch>) -> Result<Vec<InstructionId>> {
        let mut inner = self.inner.lock();
        let mut ids = Vec::with_capacity(batches.len());
        for batch in batches {
            let id = inner.last_assigned.next().ok_or(Error::IdOverflow)?;
            inner.last_assigned = id;
            inner.records.insert(id, batch.into_record(id));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn query_after(
        &self,
        id: InstructionId,
        page_size: NonZeroUsize,
    ) -> Result<Vec<InstructionBatchRecord>> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .range((Bound::Excluded(id), Bound::Unbounded))
            .take(page_size.get())
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn count_after(&self, id: InstructionId) -> Result<u64> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .range((Bound::Excluded(id), Bound::Unbounded))
            .count() as u64)
    }

    async fn max_id(&self) -> Result<InstructionId> {
        let inner = self.inner.lock();
        Ok(inner
            .records
            .last_key_value()
            .map(|(id, _)| *id)
            .unwrap_or_default())
    }

    async fn contains(&self, id: InstructionId) -> Result<bool> {
        Ok(self.inner.lock().records.contains_key(&id))
    }

    async fn delete_older_than(&self, threshold: PruneThreshold) -> Result<u64> {
        let mut inner = self.inner.lock();
        let Some(max_id) = inner.records.last_key_value().map(|(id, _)| *id) else {
            return Ok(0);
        };
        let before = inner.records.len();
        inner
            .records
            .retain(|id, record| *id == max_id || !threshold.matches(record));
        Ok((before - inner.records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachesync_id::RefresherId;
    use cachesync_instruction::RefreshInstruction;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn batch(origin: &str, secs: i64) -> NewInstructionBatch {
        NewInstructionBatch::new(
            Utc.timestamp_opt(secs, 0).unwrap(),
            origin,
            &[RefreshInstruction::refresh_all(RefresherId::from_uuid(
                Uuid::from_u128(1),
            ))],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn ids_are_assigned_in_order_and_never_reused() {
        let log = InMemoryInstructionLog::new();
        assert_eq!(log.max_id().await.unwrap(), InstructionId::NONE);

        let ids = log
            .insert(vec![batch("a", 1), batch("a", 2), batch("b", 3)])
            .await
            .unwrap();
        assert_eq!(ids, vec![1.into(), 2.into(), 3.into()]);

        let deleted = log
            .delete_older_than(PruneThreshold {
                below_id: InstructionId::new(100),
                older_than: None,
            })
            .await
            .unwrap();
        // the newest row always survives
        assert_eq!(deleted, 2);
        assert_eq!(log.ids(), vec![InstructionId::new(3)]);

        let ids = log.insert(vec![batch("a", 4)]).await.unwrap();
        assert_eq!(ids, vec![InstructionId::new(4)]);
    }

    #[tokio::test]
    async fn query_count_and_contains() {
        let log = InMemoryInstructionLog::new();
        log.insert((0..10).map(|i| batch("a", i)).collect())
            .await
            .unwrap();

        let page = log
            .query_after(InstructionId::new(3), NonZeroUsize::new(4).unwrap())
            .await
            .unwrap();
        let ids: Vec<u64> = page.iter().map(|r| r.id.as_u64()).collect();
        assert_eq!(ids, vec![4, 5, 6, 7]);

        assert_eq!(log.count_after(InstructionId::new(3)).await.unwrap(), 7);
        assert_eq!(log.count_after(InstructionId::new(10)).await.unwrap(), 0);
        assert!(log.contains(InstructionId::new(10)).await.unwrap());
        assert!(!log.contains(InstructionId::new(11)).await.unwrap());
    }

    #[tokio::test]
    async fn delete_respects_age() {
        let log = InMemoryInstructionLog::new();
        log.insert((0..5).map(|i| batch("a", i * 10)).collect())
            .await
            .unwrap();

        let deleted = log
            .delete_older_than(PruneThreshold {
                below_id: InstructionId::new(5),
                older_than: Some(Utc.timestamp_opt(25, 0).unwrap()),
            })
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(log.ids(), vec![4.into(), 5.into()]);
    }
}
