//! An instruction log kept in an object store, one object per row.
//!
//! Rows live under `{prefix}/instructions/{id:020}.batch`. The zero padding keeps the lexical
//! order of the object names equal to the numeric order of the ids, so listing with an offset
//! returns exactly the rows after a watermark. Ids are assigned by creating the object with
//! [`PutMode::Create`]: whoever creates `{id}.batch` first owns the id, everyone else gets
//! `AlreadyExists` and tries the next one.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cachesync_id::InstructionId;
use cachesync_instruction::{InstructionBatchRecord, NewInstructionBatch, SerializedInstructions};
use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutOptions, PutPayload};
use tracing::{debug, info, warn};

use crate::serialize::{StoredBatch, serialize_to_file_bytes, verify_file_type_and_deserialize};
use crate::{Error, InstructionLog, PruneThreshold, Result};

const INSTRUCTIONS_DIR: &str = "instructions";
const BATCH_EXTENSION: &str = ".batch";

/// How many ids are tried for a single batch before giving up.
const MAX_ID_ATTEMPTS: usize = 32;

/// How many objects are fetched concurrently while reading a page.
const FETCH_CONCURRENCY: usize = 8;

pub fn instructions_dir(prefix: &str) -> Path {
    Path::from(prefix).child(INSTRUCTIONS_DIR)
}

pub fn instruction_path(prefix: &str, id: InstructionId) -> Path {
    instructions_dir(prefix).child(format!("{:020}{BATCH_EXTENSION}", id.as_u64()))
}

fn id_from_path(path: &Path) -> Option<InstructionId> {
    path.filename()?
        .strip_suffix(BATCH_EXTENSION)?
        .parse::<u64>()
        .ok()
        .map(InstructionId::new)
}

#[derive(Debug)]
pub struct ObjectStoreInstructionLog {
    object_store: Arc<dyn ObjectStore>,
    prefix: String,
    /// The next id this process expects to be free. Only ever a starting point, the store is
    /// listed again before every insert.
    next_id_hint: AtomicU64,
}

impl ObjectStoreInstructionLog {
    pub fn new(object_store: Arc<dyn ObjectStore>, prefix: impl Into<String>) -> Self {
        Self {
            object_store,
            prefix: prefix.into(),
            next_id_hint: AtomicU64::new(1),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// All rows with an id greater than `after`, ascending.
    async fn list_after(&self, after: InstructionId) -> Result<Vec<(InstructionId, ObjectMeta)>> {
        let dir = instructions_dir(&self.prefix);
        let mut listing = if after.is_none() {
            self.object_store.list(Some(&dir))
        } else {
            let offset = instruction_path(&self.prefix, after);
            self.object_store.list_with_offset(Some(&dir), &offset)
        };

        let mut rows = Vec::new();
        while let Some(item) = listing.next().await {
            let meta = item?;
            match id_from_path(&meta.location) {
                Some(id) if id > after => rows.push((id, meta)),
                Some(_) => {}
                None => {
                    debug!(path = %meta.location, "ignoring unexpected object in instruction log")
                }
            }
        }
        rows.sort_by_key(|(id, _)| *id);
        Ok(rows)
    }

    async fn listed_max_id(&self) -> Result<InstructionId> {
        Ok(self
            .list_after(InstructionId::NONE)
            .await?
            .last()
            .map(|(id, _)| *id)
            .unwrap_or_default())
    }

    /// Fetch and decode one row. `None` when it was deleted since it was listed.
    ///
    /// A row that cannot be decoded is still returned, with instructions that will fail to
    /// deserialize, so that readers log it and move past it like any other bad batch.
    async fn fetch(
        &self,
        id: InstructionId,
        meta: &ObjectMeta,
    ) -> Result<Option<InstructionBatchRecord>> {
        let bytes = match self.object_store.get(&meta.location).await {
            Ok(result) => result.bytes().await,
            Err(e) => Err(e),
        };
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record = match verify_file_type_and_deserialize(bytes) {
            Ok(stored) => InstructionBatchRecord {
                id,
                utc_timestamp: stored.utc_timestamp,
                origin_identity: stored.origin_identity,
                instruction_count: stored.instruction_count,
                instructions: stored.instructions,
            },
            Err(error) => {
                warn!(%error, path = %meta.location, "unreadable instruction batch");
                InstructionBatchRecord {
                    id,
                    utc_timestamp: meta.last_modified,
                    origin_identity: "".into(),
                    instruction_count: 0,
                    instructions: SerializedInstructions::from_raw(""),
                }
            }
        };
        Ok(Some(record))
    }

    async fn fetch_all(
        &self,
        rows: &[(InstructionId, ObjectMeta)],
    ) -> Result<Vec<InstructionBatchRecord>> {
        let records: Vec<Option<InstructionBatchRecord>> = stream::iter(0..rows.len())
            .map(|i| self.fetch(rows[i].0, &rows[i].1))
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(records.into_iter().flatten().collect())
    }

    async fn create(&self, id: InstructionId, payload: PutPayload) -> Result<bool> {
        let path = instruction_path(&self.prefix, id);
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self.object_store.put_opts(&path, payload, opts).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl InstructionLog for ObjectStoreInstructionLog {
    async fn insert(&self, batches: Vec<NewInstructionBatch>) -> Result<Vec<InstructionId>> {
        if batches.is_empty() {
            return Ok(vec![]);
        }

        let mut candidate = self
            .listed_max_id()
            .await?
            .next()
            .ok_or(Error::IdOverflow)?
            .max(InstructionId::new(self.next_id_hint.load(Ordering::Acquire)));

        let mut ids = Vec::with_capacity(batches.len());
        for (n, batch) in batches.into_iter().enumerate() {
            if n > 0 {
                candidate = candidate.next().ok_or(Error::IdOverflow)?;
            }
            let stored = StoredBatch {
                utc_timestamp: batch.utc_timestamp,
                origin_identity: batch.origin_identity,
                instruction_count: batch.instruction_count,
                instructions: batch.instructions,
            };
            let payload = PutPayload::from(serialize_to_file_bytes(&stored)?);

            let mut attempts = 0;
            loop {
                attempts += 1;
                if self.create(candidate, payload.clone()).await? {
                    break;
                }
                if attempts == MAX_ID_ATTEMPTS {
                    return Err(Error::IdContention {
                        attempts,
                        last_tried: candidate,
                    });
                }
                debug!(id = %candidate, "instruction id already taken, retrying");
                let next = candidate.next().ok_or(Error::IdOverflow)?;
                candidate = self
                    .listed_max_id()
                    .await?
                    .next()
                    .ok_or(Error::IdOverflow)?
                    .max(next);
            }

            ids.push(candidate);
            self.next_id_hint
                .fetch_max(candidate.as_u64().saturating_add(1), Ordering::AcqRel);
        }
        Ok(ids)
    }

    async fn query_after(
        &self,
        id: InstructionId,
        page_size: NonZeroUsize,
    ) -> Result<Vec<InstructionBatchRecord>> {
        let mut rows = self.list_after(id).await?;
        rows.truncate(page_size.get());
        self.fetch_all(&rows).await
    }

    async fn count_after(&self, id: InstructionId) -> Result<u64> {
        Ok(self.list_after(id).await?.len() as u64)
    }

    async fn max_id(&self) -> Result<InstructionId> {
        self.listed_max_id().await
    }

    async fn contains(&self, id: InstructionId) -> Result<bool> {
        match self
            .object_store
            .head(&instruction_path(&self.prefix, id))
            .await
        {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_older_than(&self, threshold: PruneThreshold) -> Result<u64> {
        let rows = self.list_after(InstructionId::NONE).await?;
        let Some((max_id, _)) = rows.last() else {
            return Ok(0);
        };
        let max_id = *max_id;

        let candidates: Vec<(InstructionId, ObjectMeta)> = rows
            .into_iter()
            .filter(|(id, _)| *id < threshold.below_id && *id != max_id)
            .collect();

        let to_delete: Vec<(InstructionId, Path)> = match threshold.older_than {
            None => candidates
                .into_iter()
                .map(|(id, meta)| (id, meta.location))
                .collect(),
            Some(_) => {
                let locations: Vec<(InstructionId, Path)> = candidates
                    .iter()
                    .map(|(id, meta)| (*id, meta.location.clone()))
                    .collect();
                let records = self.fetch_all(&candidates).await?;
                let expired: Vec<InstructionId> = records
                    .iter()
                    .filter(|record| threshold.matches(record))
                    .map(|record| record.id)
                    .collect();
                locations
                    .into_iter()
                    .filter(|(id, _)| expired.contains(id))
                    .collect()
            }
        };

        let mut deleted = 0;
        for (id, path) in to_delete {
            match self.object_store.delete(&path).await {
                Ok(()) => {
                    debug!(%id, "deleted instruction batch");
                    deleted += 1;
                }
                // another server pruned it first
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if deleted > 0 {
            info!(
                deleted,
                below_id = %threshold.below_id,
                older_than = ?threshold.older_than,
                "pruned instruction log"
            );
        }
        Ok(deleted)
    }
}
