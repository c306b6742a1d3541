//! Cold boot detection, instruction delivery and the catch-up loop.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use cachesync_id::InstructionId;
use cachesync_instruction::{
    InstructionBatchRecord, NewInstructionBatch, RefreshInstruction, chunk_instructions,
};
use cachesync_log::InstructionLog;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::identity::LocalIdentity;
use crate::refresher::{CacheRefresherRegistry, DispatchError};
use crate::results::{InitializationResult, ProcessInstructionsResult};
use crate::retention::RetentionPolicy;
use crate::role::ServerRole;
use crate::time::{TimeProvider, elapsed};
use crate::Result;

pub const DEFAULT_MAX_INSTRUCTIONS_PER_BATCH: NonZeroUsize = NonZeroUsize::new(1_000).unwrap();
pub const DEFAULT_PAGE_SIZE: NonZeroUsize = NonZeroUsize::new(100).unwrap();
pub const DEFAULT_MAX_PROCESSING_INSTRUCTION_COUNT: u64 = 1_000;
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheInstructionConfig {
    /// The most instructions a single record written by
    /// [`CacheInstructionService::deliver_instructions_in_batches`] holds.
    pub max_instructions_per_batch: NonZeroUsize,
    /// How many records are read from the log at a time while catching up.
    pub page_size: NonZeroUsize,
    /// A backlog of more records than this is not replayed, the server cold boots instead.
    /// Records are counted, not the instructions they hold.
    pub max_processing_instruction_count: u64,
    /// Minimum time between two prunes of the log.
    pub prune_interval: Duration,
    pub retention: RetentionPolicy,
}

impl Default for CacheInstructionConfig {
    fn default() -> Self {
        Self {
            max_instructions_per_batch: DEFAULT_MAX_INSTRUCTIONS_PER_BATCH,
            page_size: DEFAULT_PAGE_SIZE,
            max_processing_instruction_count: DEFAULT_MAX_PROCESSING_INSTRUCTION_COUNT,
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            retention: RetentionPolicy::default(),
        }
    }
}

/// Whether the server is still taking part in cache synchronisation.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum ServiceState {
    #[default]
    Running,
    /// Shutting down, nothing must be read or applied anymore.
    Released,
}

#[derive(Debug, Clone)]
pub struct CacheInstructionService {
    log: Arc<dyn InstructionLog>,
    time_provider: Arc<dyn TimeProvider>,
    config: CacheInstructionConfig,
}

impl CacheInstructionService {
    pub fn new(
        log: Arc<dyn InstructionLog>,
        time_provider: Arc<dyn TimeProvider>,
        config: CacheInstructionConfig,
    ) -> Self {
        Self {
            log,
            time_provider,
            config,
        }
    }

    pub fn config(&self) -> &CacheInstructionConfig {
        &self.config
    }

    pub fn time_provider(&self) -> Arc<dyn TimeProvider> {
        Arc::clone(&self.time_provider)
    }

    pub fn log(&self) -> Arc<dyn InstructionLog> {
        Arc::clone(&self.log)
    }

    /// Whether replaying from `last_id` would miss records, so the local caches must be flushed
    /// instead.
    ///
    /// A server that never applied anything must cold boot as soon as the log holds records. A
    /// server whose watermark record is gone, pruned while it was down, must cold boot too.
    pub async fn is_cold_boot_required(&self, last_id: InstructionId) -> Result<bool> {
        if last_id.is_none() {
            return Ok(!self.log.max_id().await?.is_none());
        }
        Ok(!self.log.contains(last_id).await?)
    }

    /// Whether records a running server at `last_id` has not applied yet were pruned.
    ///
    /// For a positive watermark this is [`Self::is_cold_boot_required`]. A watermark of zero only
    /// has a gap once the first record ever appended is gone.
    pub async fn is_history_pruned(&self, last_id: InstructionId) -> Result<bool> {
        if !last_id.is_none() {
            return self.is_cold_boot_required(last_id).await;
        }
        let first = self
            .log
            .query_after(InstructionId::NONE, NonZeroUsize::MIN)
            .await?;
        Ok(first
            .first()
            .is_some_and(|record| record.id > InstructionId::new(1)))
    }

    /// Whether more than `limit` records were appended after `last_id`. The record count is
    /// returned either way, however many instructions each record holds.
    pub async fn is_instruction_count_over_limit(
        &self,
        last_id: InstructionId,
        limit: u64,
    ) -> Result<(bool, u64)> {
        let count = self.log.count_after(last_id).await?;
        Ok((count > limit, count))
    }

    pub async fn get_max_instruction_id(&self) -> Result<InstructionId> {
        Ok(self.log.max_id().await?)
    }

    /// Decide how a server continues from the watermark it saved, `None` if it never synced.
    ///
    /// The max id is read before anything else, so when a cold boot is required, records appended
    /// while the caller flushes its caches are replayed afterwards instead of being lost. With
    /// `cold_boot_allowed` unset a large backlog is replayed rather than flushed, a missing
    /// watermark record still forces a cold boot.
    pub async fn ensure_initialized(
        &self,
        cold_boot_allowed: bool,
        last_id: Option<InstructionId>,
        state: ServiceState,
    ) -> Result<InitializationResult> {
        if state == ServiceState::Released {
            return Ok(InitializationResult::uninitialized());
        }

        let max_id = self.log.max_id().await?;

        let cold_boot_required = match last_id {
            None => {
                warn!(%max_id, "no last synced instruction id, cold boot required");
                true
            }
            Some(last_id) if self.is_cold_boot_required(last_id).await? => {
                warn!(
                    %last_id,
                    %max_id,
                    "last synced instruction is no longer in the log, cold boot required"
                );
                true
            }
            Some(last_id) if cold_boot_allowed => {
                let limit = self.config.max_processing_instruction_count;
                let (over_limit, count) =
                    self.is_instruction_count_over_limit(last_id, limit).await?;
                if over_limit {
                    warn!(
                        record_count = count,
                        max_processing_instruction_count = limit,
                        "record backlog exceeds the processing limit, cold boot required"
                    );
                }
                over_limit
            }
            Some(_) => false,
        };

        let last_id = match last_id {
            Some(last_id) if !cold_boot_required => last_id,
            _ => max_id,
        };
        Ok(InitializationResult::initialized(
            cold_boot_required,
            max_id,
            last_id,
        ))
    }

    fn new_batch(
        &self,
        instructions: &[RefreshInstruction],
        local_identity: &LocalIdentity,
    ) -> Result<NewInstructionBatch> {
        Ok(NewInstructionBatch::new(
            self.time_provider.now(),
            local_identity.as_arc(),
            instructions,
        )?)
    }

    /// Append all `instructions` as a single record. Nothing is appended when there are none.
    pub async fn deliver_instructions(
        &self,
        instructions: &[RefreshInstruction],
        local_identity: &LocalIdentity,
    ) -> Result<Vec<InstructionId>> {
        if instructions.is_empty() {
            return Ok(vec![]);
        }
        let batch = self.new_batch(instructions, local_identity)?;
        let ids = self.log.insert(vec![batch]).await?;
        debug!(
            n_instructions = instructions.len(),
            ids = ?ids,
            "delivered cache instructions"
        );
        Ok(ids)
    }

    /// Append `instructions` as consecutive records of at most
    /// [`CacheInstructionConfig::max_instructions_per_batch`] instructions each.
    pub async fn deliver_instructions_in_batches(
        &self,
        instructions: Vec<RefreshInstruction>,
        local_identity: &LocalIdentity,
    ) -> Result<Vec<InstructionId>> {
        let n_instructions = instructions.len();
        let batches = chunk_instructions(instructions, self.config.max_instructions_per_batch)
            .iter()
            .map(|chunk| self.new_batch(chunk, local_identity))
            .collect::<Result<Vec<_>>>()?;
        if batches.is_empty() {
            return Ok(vec![]);
        }
        let ids = self.log.insert(batches).await?;
        debug!(n_instructions, ids = ?ids, "delivered cache instructions in batches");
        Ok(ids)
    }

    /// [`Self::process_instructions`] for a server that does not know its role, it never prunes.
    pub async fn process_instructions_without_role(
        &self,
        registry: &CacheRefresherRegistry,
        local_identity: &LocalIdentity,
        last_pruned: Option<DateTime<Utc>>,
        last_id: InstructionId,
        cancellation: &CancellationToken,
    ) -> Result<ProcessInstructionsResult> {
        self.process_instructions(
            registry,
            ServerRole::Unknown,
            local_identity,
            last_pruned,
            last_id,
            cancellation,
        )
        .await
    }

    /// Apply every record appended after `last_id`, in id order, then prune the log if `role`
    /// allows it and the last prune is old enough.
    ///
    /// Records appended by `local_identity` are skipped, their instructions were applied when
    /// they were delivered. A record that cannot be read, or an instruction whose refresher is
    /// unknown or fails, is logged and moved past. Failing to read the log aborts the cycle with
    /// the error; the caller keeps its previous watermark and tries again later.
    ///
    /// `cancellation` is checked between records, the returned watermark always points at a
    /// record that was fully processed.
    pub async fn process_instructions(
        &self,
        registry: &CacheRefresherRegistry,
        role: ServerRole,
        local_identity: &LocalIdentity,
        last_pruned: Option<DateTime<Utc>>,
        last_id: InstructionId,
        cancellation: &CancellationToken,
    ) -> Result<ProcessInstructionsResult> {
        let page_size = self.config.page_size;
        let mut last_id = last_id;
        let mut processed = 0;

        'pages: loop {
            if cancellation.is_cancelled() {
                break;
            }
            let page = self.log.query_after(last_id, page_size).await?;
            let last_page = page.len() < page_size.get();

            for record in page {
                if cancellation.is_cancelled() {
                    info!(%last_id, "instruction processing cancelled");
                    break 'pages;
                }
                processed += process_record(registry, local_identity, &record);
                last_id = record.id;
            }

            if last_page {
                break;
            }
        }

        if cancellation.is_cancelled() {
            return Ok(ProcessInstructionsResult::completed(processed, last_id));
        }

        if role.grants_pruning() && self.prune_due(last_pruned) && self.prune(last_id).await {
            return Ok(ProcessInstructionsResult::completed_and_pruned(
                processed, last_id,
            ));
        }

        Ok(ProcessInstructionsResult::completed(processed, last_id))
    }

    fn prune_due(&self, last_pruned: Option<DateTime<Utc>>) -> bool {
        last_pruned.is_none_or(|last_pruned| {
            elapsed(self.time_provider.now(), last_pruned) >= self.config.prune_interval
        })
    }

    /// Delete what the retention policy allows, given this server applied everything up to
    /// `last_id`. Returns whether the prune ran.
    async fn prune(&self, last_id: InstructionId) -> bool {
        let max_id = match self.log.max_id().await {
            Ok(max_id) => max_id,
            Err(error) => {
                error!(%error, "failed to read the max instruction id before pruning");
                return false;
            }
        };

        let now = self.time_provider.now();
        let Some(threshold) = self.config.retention.threshold(now, max_id, last_id) else {
            debug!(%max_id, %last_id, "nothing to prune from the instruction log");
            return true;
        };

        match self.log.delete_older_than(threshold).await {
            Ok(deleted) => {
                debug!(
                    deleted,
                    below_id = %threshold.below_id,
                    older_than = ?threshold.older_than,
                    "pruned instruction log"
                );
                true
            }
            Err(error) => {
                error!(%error, "failed to prune the instruction log");
                false
            }
        }
    }
}

/// Apply one record, returning how many instructions it accounts for.
fn process_record(
    registry: &CacheRefresherRegistry,
    local_identity: &LocalIdentity,
    record: &InstructionBatchRecord,
) -> u64 {
    if record.is_from(local_identity.as_str()) {
        return u64::from(record.instruction_count);
    }

    let instructions = match record.instructions.deserialize() {
        Ok(instructions) => instructions,
        Err(error) => {
            error!(
                %error,
                id = %record.id,
                origin = %record.origin_identity,
                instructions = record.instructions.as_str(),
                "failed to deserialize instructions, skipping record"
            );
            return 0;
        }
    };

    for instruction in &instructions {
        match registry.dispatch(instruction) {
            Ok(()) => {}
            Err(DispatchError::UnknownRefresher(refresher_id)) => {
                warn!(
                    %refresher_id,
                    id = %record.id,
                    refresh_type = %instruction.refresh_type(),
                    "no cache refresher registered, skipping instruction"
                );
            }
            Err(error) => {
                error!(
                    %error,
                    id = %record.id,
                    origin = %record.origin_identity,
                    refresh_type = %instruction.refresh_type(),
                    "distributed cache is not updated, failed to apply instruction"
                );
            }
        }
    }
    debug!(
        id = %record.id,
        origin = %record.origin_identity,
        n_instructions = instructions.len(),
        "applied instruction record"
    );

    instructions.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresher::test_util::{Applied, RecordingRefresher};
    use crate::refresher::CacheRefresher;
    use crate::time::MockProvider;
    use async_trait::async_trait;
    use cachesync_id::EntityId;
    use cachesync_log::memory::InMemoryInstructionLog;
    use cachesync_log::PruneThreshold;
    use chrono::{TimeDelta, TimeZone};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    const LOCAL: &str = "server-a";
    const REMOTE: &str = "server-b";

    struct Harness {
        log: Arc<InMemoryInstructionLog>,
        time: Arc<MockProvider>,
        service: CacheInstructionService,
        registry: CacheRefresherRegistry,
        refresher: Arc<RecordingRefresher>,
        local: LocalIdentity,
        remote: LocalIdentity,
    }

    impl Harness {
        fn new(config: CacheInstructionConfig) -> Self {
            let log = Arc::new(InMemoryInstructionLog::new());
            let time = Arc::new(MockProvider::new(start()));
            let service = CacheInstructionService::new(
                Arc::clone(&log) as _,
                Arc::clone(&time) as _,
                config,
            );
            let registry = CacheRefresherRegistry::new();
            let refresher = RecordingRefresher::new(1, "content");
            registry.register(Arc::clone(&refresher) as _);
            Self {
                log,
                time,
                service,
                registry,
                refresher,
                local: LocalIdentity::from_raw(LOCAL),
                remote: LocalIdentity::from_raw(REMOTE),
            }
        }

        fn instruction(&self, entity: i64) -> RefreshInstruction {
            RefreshInstruction::refresh_by_ids(self.refresher.refresher_id(), [entity])
        }

        /// One record per element of `entities`, appended by the remote server.
        async fn deliver_remote(&self, entities: &[&[i64]]) -> Vec<InstructionId> {
            let mut ids = vec![];
            for batch in entities {
                let instructions: Vec<_> = batch.iter().map(|e| self.instruction(*e)).collect();
                ids.extend(
                    self.service
                        .deliver_instructions(&instructions, &self.remote)
                        .await
                        .unwrap(),
                );
            }
            ids
        }

        async fn process(
            &self,
            role: ServerRole,
            last_pruned: Option<DateTime<Utc>>,
            last_id: InstructionId,
        ) -> ProcessInstructionsResult {
            self.service
                .process_instructions(
                    &self.registry,
                    role,
                    &self.local,
                    last_pruned,
                    last_id,
                    &CancellationToken::new(),
                )
                .await
                .unwrap()
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn refreshed(ids: &[i64]) -> Vec<Applied> {
        ids.iter()
            .map(|id| Applied::Refresh(vec![EntityId::Int(*id)]))
            .collect()
    }

    #[test_log::test(tokio::test)]
    async fn cold_boot_detection() {
        let h = Harness::new(Default::default());
        assert!(!h.service.is_cold_boot_required(InstructionId::NONE).await.unwrap());

        h.deliver_remote(&[&[1], &[2], &[3]]).await;
        assert!(h.service.is_cold_boot_required(InstructionId::NONE).await.unwrap());
        assert!(!h.service.is_cold_boot_required(InstructionId::new(2)).await.unwrap());

        h.log
            .delete_older_than(PruneThreshold {
                below_id: InstructionId::new(3),
                older_than: None,
            })
            .await
            .unwrap();
        assert!(h.service.is_cold_boot_required(InstructionId::new(2)).await.unwrap());
        assert!(!h.service.is_cold_boot_required(InstructionId::new(3)).await.unwrap());
        assert_eq!(
            h.service.get_max_instruction_id().await.unwrap(),
            InstructionId::new(3)
        );
    }

    #[test_log::test(tokio::test)]
    async fn history_pruned_below_a_zero_watermark() {
        let h = Harness::new(Default::default());
        assert!(!h.service.is_history_pruned(InstructionId::NONE).await.unwrap());

        h.deliver_remote(&[&[1], &[2], &[3]]).await;
        assert!(!h.service.is_history_pruned(InstructionId::NONE).await.unwrap());

        h.log
            .delete_older_than(PruneThreshold {
                below_id: InstructionId::new(3),
                older_than: None,
            })
            .await
            .unwrap();
        assert!(h.service.is_history_pruned(InstructionId::NONE).await.unwrap());
        assert!(h.service.is_history_pruned(InstructionId::new(2)).await.unwrap());
        assert!(!h.service.is_history_pruned(InstructionId::new(3)).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn count_over_limit_always_reports_the_count() {
        let h = Harness::new(Default::default());
        h.deliver_remote(&[&[1], &[2], &[3], &[4]]).await;
        assert_eq!(
            h.service
                .is_instruction_count_over_limit(InstructionId::new(1), 3)
                .await
                .unwrap(),
            (false, 3)
        );
        assert_eq!(
            h.service
                .is_instruction_count_over_limit(InstructionId::NONE, 3)
                .await
                .unwrap(),
            (true, 4)
        );

        // one record, however large, counts once
        h.deliver_remote(&[&[5, 6, 7, 8, 9]]).await;
        assert_eq!(
            h.service
                .is_instruction_count_over_limit(InstructionId::new(4), 1)
                .await
                .unwrap(),
            (false, 1)
        );
    }

    #[test_log::test(tokio::test)]
    async fn ensure_initialized_cases() {
        let config = CacheInstructionConfig {
            max_processing_instruction_count: 2,
            ..Default::default()
        };
        let h = Harness::new(config);

        let released = h
            .service
            .ensure_initialized(true, None, ServiceState::Released)
            .await
            .unwrap();
        assert_eq!(released, InitializationResult::uninitialized());
        assert!(!released.is_initialized());

        // empty log, synced before: nothing to do
        let result = h
            .service
            .ensure_initialized(true, Some(InstructionId::NONE), ServiceState::Running)
            .await
            .unwrap();
        assert_eq!(
            result,
            InitializationResult::initialized(false, InstructionId::NONE, InstructionId::NONE)
        );

        h.deliver_remote(&[&[1], &[2], &[3], &[4]]).await;

        // never synced
        let result = h
            .service
            .ensure_initialized(true, None, ServiceState::Running)
            .await
            .unwrap();
        assert_eq!(
            result,
            InitializationResult::initialized(true, InstructionId::new(4), InstructionId::new(4))
        );

        // within the limit
        let result = h
            .service
            .ensure_initialized(true, Some(InstructionId::new(2)), ServiceState::Running)
            .await
            .unwrap();
        assert_eq!(
            result,
            InitializationResult::initialized(false, InstructionId::new(4), InstructionId::new(2))
        );

        // over the limit, only when a cold boot is allowed
        let result = h
            .service
            .ensure_initialized(true, Some(InstructionId::new(1)), ServiceState::Running)
            .await
            .unwrap();
        assert!(result.cold_boot_required());
        assert_eq!(result.last_id(), InstructionId::new(4));
        let result = h
            .service
            .ensure_initialized(false, Some(InstructionId::new(1)), ServiceState::Running)
            .await
            .unwrap();
        assert!(!result.cold_boot_required());
        assert_eq!(result.last_id(), InstructionId::new(1));

        // watermark pruned away forces a cold boot even when not allowed for the backlog
        let result = h
            .service
            .ensure_initialized(false, Some(InstructionId::new(50)), ServiceState::Running)
            .await
            .unwrap();
        assert_eq!(
            result,
            InitializationResult::initialized(true, InstructionId::new(4), InstructionId::new(4))
        );
    }

    #[test_log::test(tokio::test)]
    async fn chunked_delivery_gets_one_id_per_chunk() {
        let config = CacheInstructionConfig {
            max_instructions_per_batch: NonZeroUsize::new(3).unwrap(),
            ..Default::default()
        };
        let h = Harness::new(config);
        let instructions: Vec<_> = (0..7).map(|e| h.instruction(e)).collect();

        let ids = h
            .service
            .deliver_instructions_in_batches(instructions.clone(), &h.local)
            .await
            .unwrap();
        assert_eq!(ids, vec![1.into(), 2.into(), 3.into()]);

        let records = h
            .log
            .query_after(InstructionId::NONE, NonZeroUsize::new(10).unwrap())
            .await
            .unwrap();
        let counts: Vec<u32> = records.iter().map(|r| r.instruction_count).collect();
        assert_eq!(counts, vec![3, 3, 1]);
        assert!(records.iter().all(|r| r.is_from(LOCAL)));
        let joined: Vec<RefreshInstruction> = records
            .iter()
            .flat_map(|r| r.instructions.deserialize().unwrap())
            .collect();
        assert_eq!(joined, instructions);

        let ids = h
            .service
            .deliver_instructions_in_batches(vec![], &h.local)
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert_eq!(h.log.len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn applies_remote_records_in_id_order() {
        let h = Harness::new(Default::default());
        // records 1 to 9 were applied before
        for _ in 0..9 {
            h.deliver_remote(&[&[0]]).await;
        }
        let ids = h.deliver_remote(&[&[10, 11], &[12]]).await;
        assert_eq!(ids, vec![10.into(), 11.into()]);

        let result = h
            .process(ServerRole::Subscriber, None, InstructionId::new(9))
            .await;
        assert_eq!(
            result,
            ProcessInstructionsResult::completed(3, InstructionId::new(11))
        );
        assert!(!result.instructions_were_pruned());
        assert_eq!(h.refresher.applied(), refreshed(&[10, 11, 12]));

        // nothing new
        let result = h
            .process(ServerRole::Subscriber, None, result.last_id())
            .await;
        assert_eq!(
            result,
            ProcessInstructionsResult::completed(0, InstructionId::new(11))
        );
    }

    #[test_log::test(tokio::test)]
    async fn reprocessing_is_idempotent_for_the_cache() {
        let h = Harness::new(Default::default());
        h.deliver_remote(&[&[1, 2], &[3]]).await;

        let first = h.process(ServerRole::Subscriber, None, InstructionId::NONE).await;
        let second = h.process(ServerRole::Subscriber, None, InstructionId::NONE).await;
        assert_eq!(first, second);
        // the cache below would end up in the same state, the same instructions were applied
        assert_eq!(h.refresher.applied(), refreshed(&[1, 2, 3, 1, 2, 3]));
    }

    #[test_log::test(tokio::test)]
    async fn pages_through_a_long_backlog() {
        let config = CacheInstructionConfig {
            page_size: NonZeroUsize::new(2).unwrap(),
            ..Default::default()
        };
        let h = Harness::new(config);
        h.deliver_remote(&[&[1], &[2], &[3], &[4], &[5]]).await;

        let result = h.process(ServerRole::Subscriber, None, InstructionId::NONE).await;
        assert_eq!(result.last_id(), InstructionId::new(5));
        assert_eq!(result.number_of_instructions_processed(), 5);
        assert_eq!(h.refresher.applied(), refreshed(&[1, 2, 3, 4, 5]));
    }

    #[test_log::test(tokio::test)]
    async fn local_records_are_counted_but_not_applied() {
        let h = Harness::new(Default::default());
        h.service
            .deliver_instructions(&[h.instruction(1), h.instruction(2)], &h.local)
            .await
            .unwrap();
        h.deliver_remote(&[&[3]]).await;

        let result = h.process(ServerRole::Subscriber, None, InstructionId::NONE).await;
        assert_eq!(
            result,
            ProcessInstructionsResult::completed(3, InstructionId::new(2))
        );
        assert_eq!(h.refresher.applied(), refreshed(&[3]));
    }

    #[test_log::test(tokio::test)]
    async fn poisoned_record_is_skipped_and_passed() {
        let h = Harness::new(Default::default());
        h.deliver_remote(&[&[1]]).await;
        h.log
            .insert(vec![NewInstructionBatch {
                utc_timestamp: start(),
                origin_identity: REMOTE.into(),
                instruction_count: 1,
                instructions: cachesync_instruction::SerializedInstructions::from_raw(
                    "[{\"refresher_id\":",
                ),
            }])
            .await
            .unwrap();
        h.deliver_remote(&[&[3]]).await;

        let result = h.process(ServerRole::Subscriber, None, InstructionId::NONE).await;
        assert_eq!(result.last_id(), InstructionId::new(3));
        assert_eq!(result.number_of_instructions_processed(), 2);
        assert_eq!(h.refresher.applied(), refreshed(&[1, 3]));
    }

    #[test_log::test(tokio::test)]
    async fn unknown_and_failing_refreshers_do_not_stop_the_batch() {
        let h = Harness::new(Default::default());
        let broken = RecordingRefresher::new(2, "broken");
        broken.fail.store(true, Ordering::SeqCst);
        h.registry.register(Arc::clone(&broken) as _);
        let unknown = cachesync_id::RefresherId::from_uuid(uuid::Uuid::from_u128(3));

        h.service
            .deliver_instructions(
                &[
                    RefreshInstruction::refresh_all(unknown),
                    RefreshInstruction::refresh_all(broken.refresher_id()),
                    h.instruction(1),
                ],
                &h.remote,
            )
            .await
            .unwrap();
        h.deliver_remote(&[&[2]]).await;

        let result = h.process(ServerRole::Subscriber, None, InstructionId::NONE).await;
        assert_eq!(
            result,
            ProcessInstructionsResult::completed(4, InstructionId::new(2))
        );
        assert_eq!(h.refresher.applied(), refreshed(&[1, 2]));
        assert!(broken.applied().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn cancellation_stops_between_records() {
        let h = Harness::new(Default::default());
        h.deliver_remote(&[&[1], &[2]]).await;
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let result = h
            .service
            .process_instructions(
                &h.registry,
                ServerRole::Single,
                &h.local,
                None,
                InstructionId::NONE,
                &cancellation,
            )
            .await
            .unwrap();
        assert_eq!(
            result,
            ProcessInstructionsResult::completed(0, InstructionId::NONE)
        );
        assert!(h.refresher.applied().is_empty());
        assert_eq!(h.log.len(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn pruning_is_gated_by_role_and_interval() {
        let config = CacheInstructionConfig {
            retention: RetentionPolicy::MaxAge(Duration::from_secs(3600)),
            prune_interval: Duration::from_secs(60),
            ..Default::default()
        };
        let h = Harness::new(config);
        h.deliver_remote(&[&[1], &[2], &[3]]).await;
        h.time.inc(TimeDelta::hours(2));
        h.deliver_remote(&[&[4]]).await;

        // no pruning rights
        for role in [ServerRole::Publisher, ServerRole::Subscriber, ServerRole::Unknown] {
            let result = h.process(role, None, InstructionId::NONE).await;
            assert!(!result.instructions_were_pruned());
        }
        let result = h
            .service
            .process_instructions_without_role(
                &h.registry,
                &h.local,
                None,
                InstructionId::NONE,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!result.instructions_were_pruned());
        assert_eq!(h.log.len(), 4);

        // pruned recently
        let last_pruned = h.time.now() - TimeDelta::seconds(30);
        let result = h
            .process(ServerRole::Single, Some(last_pruned), InstructionId::new(4))
            .await;
        assert!(!result.instructions_were_pruned());
        assert_eq!(h.log.len(), 4);

        let last_pruned = h.time.now() - TimeDelta::seconds(61);
        let result = h
            .process(
                ServerRole::SchedulingPublisher,
                Some(last_pruned),
                InstructionId::new(4),
            )
            .await;
        assert!(result.instructions_were_pruned());
        assert_eq!(h.log.ids(), vec![InstructionId::new(4)]);
    }

    #[test_log::test(tokio::test)]
    async fn pruning_keeps_what_a_slower_server_needs() {
        let config = CacheInstructionConfig {
            retention: RetentionPolicy::IdDistance(3),
            ..Default::default()
        };
        let h = Harness::new(config);
        let entities: Vec<[i64; 1]> = (1..=10).map(|e| [e]).collect();
        let batches: Vec<&[i64]> = entities.iter().map(|e| e.as_slice()).collect();
        h.deliver_remote(&batches).await;

        let result = h.process(ServerRole::Single, None, InstructionId::NONE).await;
        assert!(result.instructions_were_pruned());
        assert_eq!(h.log.ids(), (7..=10).map(InstructionId::new).collect::<Vec<_>>());
        // a server 3 records behind is within the margin and keeps replaying
        assert!(!h.service.is_cold_boot_required(InstructionId::new(7)).await.unwrap());
        // one further behind has to cold boot
        assert!(h.service.is_cold_boot_required(InstructionId::new(6)).await.unwrap());
    }

    #[test_log::test(tokio::test)]
    async fn pruner_never_deletes_beyond_its_own_watermark() {
        let config = CacheInstructionConfig {
            retention: RetentionPolicy::IdDistance(0),
            ..Default::default()
        };
        let h = Harness::new(config);
        h.deliver_remote(&[&[1], &[2], &[3], &[4], &[5]]).await;

        assert!(h.service.prune(InstructionId::new(2)).await);
        assert_eq!(h.log.ids(), (2..=5).map(InstructionId::new).collect::<Vec<_>>());
    }

    #[derive(Debug, Default)]
    struct FailingLog {
        inner: InMemoryInstructionLog,
        fail_queries: AtomicBool,
        fail_deletes: AtomicBool,
    }

    fn unavailable() -> cachesync_log::Error {
        cachesync_log::Error::ObjectStore(object_store::Error::Generic {
            store: "test",
            source: "unavailable".into(),
        })
    }

    #[async_trait]
    impl InstructionLog for FailingLog {
        async fn insert(
            &self,
            batches: Vec<NewInstructionBatch>,
        ) -> cachesync_log::Result<Vec<InstructionId>> {
            self.inner.insert(batches).await
        }

        async fn query_after(
            &self,
            id: InstructionId,
            page_size: NonZeroUsize,
        ) -> cachesync_log::Result<Vec<InstructionBatchRecord>> {
            if self.fail_queries.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            self.inner.query_after(id, page_size).await
        }

        async fn count_after(&self, id: InstructionId) -> cachesync_log::Result<u64> {
            self.inner.count_after(id).await
        }

        async fn max_id(&self) -> cachesync_log::Result<InstructionId> {
            self.inner.max_id().await
        }

        async fn contains(&self, id: InstructionId) -> cachesync_log::Result<bool> {
            self.inner.contains(id).await
        }

        async fn delete_older_than(
            &self,
            threshold: PruneThreshold,
        ) -> cachesync_log::Result<u64> {
            if self.fail_deletes.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            self.inner.delete_older_than(threshold).await
        }
    }

    #[test_log::test(tokio::test)]
    async fn store_failures() {
        let log = Arc::new(FailingLog::default());
        let service = CacheInstructionService::new(
            Arc::clone(&log) as _,
            Arc::new(MockProvider::new(start())),
            CacheInstructionConfig {
                retention: RetentionPolicy::IdDistance(0),
                ..Default::default()
            },
        );
        let registry = CacheRefresherRegistry::new();
        let local = LocalIdentity::from_raw(LOCAL);
        let refresher = cachesync_id::RefresherId::from_uuid(uuid::Uuid::from_u128(1));
        service
            .deliver_instructions(
                &[RefreshInstruction::refresh_all(refresher)],
                &LocalIdentity::from_raw(REMOTE),
            )
            .await
            .unwrap();
        service
            .deliver_instructions(
                &[RefreshInstruction::refresh_all(refresher)],
                &LocalIdentity::from_raw(REMOTE),
            )
            .await
            .unwrap();

        // a failed fetch aborts the cycle
        log.fail_queries.store(true, Ordering::SeqCst);
        let err = service
            .process_instructions(
                &registry,
                ServerRole::Single,
                &local,
                None,
                InstructionId::NONE,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Log(_)), "{err}");

        // a failed prune is reported, not returned
        log.fail_queries.store(false, Ordering::SeqCst);
        log.fail_deletes.store(true, Ordering::SeqCst);
        let result = service
            .process_instructions(
                &registry,
                ServerRole::Single,
                &local,
                None,
                InstructionId::NONE,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(
            result,
            ProcessInstructionsResult::completed(2, InstructionId::new(2))
        );
    }
}
