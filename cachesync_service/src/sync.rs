//! Drives cache synchronisation for one server.

use std::sync::Arc;
use std::time::Duration;

use cachesync_id::InstructionId;
use cachesync_instruction::RefreshInstruction;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::identity::LocalIdentity;
use crate::refresher::{CacheRefresherRegistry, apply};
use crate::results::{InitializationResult, ProcessInstructionsResult};
use crate::role::ServerRoleProvider;
use crate::service::{CacheInstructionService, ServiceState};
use crate::time::elapsed;
use crate::watermark::WatermarkStore;
use crate::Result;

pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(5);
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheSyncConfig {
    /// Minimum time between two sync cycles.
    pub throttle: Duration,
    /// Cold boot instead of replaying when the backlog is over the processing limit.
    pub cold_boot_allowed: bool,
}

impl Default for CacheSyncConfig {
    fn default() -> Self {
        Self {
            throttle: DEFAULT_THROTTLE,
            cold_boot_allowed: true,
        }
    }
}

/// Invoked after the local caches were flushed by a cold boot.
pub type InitializingCallback = Box<dyn Fn(&InitializationResult) + Send + Sync>;

#[derive(Debug)]
pub struct CacheSyncArgs {
    pub service: CacheInstructionService,
    pub registry: Arc<CacheRefresherRegistry>,
    pub role_provider: Arc<dyn ServerRoleProvider>,
    pub watermark_store: Arc<dyn WatermarkStore>,
    pub identity: LocalIdentity,
    pub config: CacheSyncConfig,
}

#[derive(Debug, Default, Clone, Copy)]
struct SyncState {
    booted: bool,
    last_id: InstructionId,
    last_sync: Option<DateTime<Utc>>,
    last_pruned: Option<DateTime<Utc>>,
}

/// Keeps the local caches of one server in line with the rest of the farm.
///
/// [`boot`](Self::boot) once at startup, then call [`sync`](Self::sync) periodically, usually
/// through [`spawn_background`](Self::spawn_background). Local changes are applied and shared
/// with [`distribute`](Self::distribute). Cycles never overlap: a cycle started while another
/// one runs is skipped.
pub struct CacheSync {
    service: CacheInstructionService,
    registry: Arc<CacheRefresherRegistry>,
    role_provider: Arc<dyn ServerRoleProvider>,
    watermark_store: Arc<dyn WatermarkStore>,
    identity: LocalIdentity,
    config: CacheSyncConfig,
    state: Mutex<SyncState>,
    /// Held for the duration of a cycle.
    cycle: tokio::sync::Mutex<()>,
    released: CancellationToken,
    initializing_callbacks: Mutex<Vec<Arc<dyn Fn(&InitializationResult) + Send + Sync>>>,
}

impl std::fmt::Debug for CacheSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSync")
            .field("service", &self.service)
            .field("registry", &self.registry)
            .field("role_provider", &self.role_provider)
            .field("watermark_store", &self.watermark_store)
            .field("identity", &self.identity)
            .field("config", &self.config)
            .field("state", &self.state)
            .field("released", &self.released.is_cancelled())
            .field(
                "initializing_callbacks",
                &self.initializing_callbacks.lock().len(),
            )
            .finish_non_exhaustive()
    }
}

impl CacheSync {
    pub fn new(
        CacheSyncArgs {
            service,
            registry,
            role_provider,
            watermark_store,
            identity,
            config,
        }: CacheSyncArgs,
    ) -> Self {
        Self {
            service,
            registry,
            role_provider,
            watermark_store,
            identity,
            config,
            state: Default::default(),
            cycle: Default::default(),
            released: CancellationToken::new(),
            initializing_callbacks: Default::default(),
        }
    }

    pub fn service(&self) -> &CacheInstructionService {
        &self.service
    }

    pub fn registry(&self) -> &Arc<CacheRefresherRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// Id of the last record this server applied.
    pub fn last_id(&self) -> InstructionId {
        self.state.lock().last_id
    }

    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }

    /// Register a callback to run after every cold boot, once the refreshers were flushed.
    pub fn add_initializing_callback(&self, callback: InitializingCallback) {
        self.initializing_callbacks.lock().push(Arc::from(callback));
    }

    fn service_state(&self) -> ServiceState {
        if self.is_released() {
            ServiceState::Released
        } else {
            ServiceState::Running
        }
    }

    /// Load the saved watermark and decide whether this server can replay from it or must cold
    /// boot. Must run before the first [`sync`](Self::sync), which boots on its own otherwise.
    pub async fn boot(&self) -> Result<InitializationResult> {
        let _cycle = self.cycle.lock().await;
        self.boot_locked().await
    }

    async fn boot_locked(&self) -> Result<InitializationResult> {
        let saved = self.watermark_store.load().await?;
        let result = self
            .service
            .ensure_initialized(self.config.cold_boot_allowed, saved, self.service_state())
            .await?;
        if !result.is_initialized() {
            return Ok(result);
        }

        if result.cold_boot_required() {
            self.cold_boot(&result);
        }
        self.adopt(result.last_id()).await?;
        self.state.lock().booted = true;
        info!(
            identity = %self.identity,
            last_id = %result.last_id(),
            max_id = %result.max_id(),
            cold_boot = result.cold_boot_required(),
            "cache sync booted"
        );
        Ok(result)
    }

    /// Flush every local cache and run the initializing callbacks.
    fn cold_boot(&self, result: &InitializationResult) {
        warn!(
            identity = %self.identity,
            max_id = %result.max_id(),
            "cold boot, refreshing all caches"
        );
        for refresher in self.registry.all() {
            if let Err(error) = apply(
                refresher.as_ref(),
                &cachesync_instruction::RefreshOperation::RefreshAll,
            ) {
                error!(%error, "failed to refresh cache during cold boot");
            }
        }
        // callbacks may register further callbacks
        let callbacks = self.initializing_callbacks.lock().clone();
        for callback in callbacks {
            callback(result);
        }
    }

    async fn adopt(&self, last_id: InstructionId) -> Result<()> {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.last_id != last_id || !state.booted;
            state.last_id = last_id;
            changed
        };
        if changed {
            self.watermark_store.save(last_id).await?;
        }
        Ok(())
    }

    /// Run one catch-up cycle.
    ///
    /// Returns `None` when the cycle was skipped: the server was released, the previous cycle
    /// started less than the throttle interval ago, or another cycle is still running.
    pub async fn sync(&self) -> Result<Option<ProcessInstructionsResult>> {
        self.sync_until(&self.released).await
    }

    /// [`Self::sync`], stopping between two records once `cancellation` is cancelled.
    async fn sync_until(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<Option<ProcessInstructionsResult>> {
        if self.is_released() || cancellation.is_cancelled() {
            return Ok(None);
        }

        let now = self.service.time_provider().now();
        let last_sync = self.state.lock().last_sync;
        if last_sync.is_some_and(|last_sync| elapsed(now, last_sync) < self.config.throttle) {
            trace!("sync throttled");
            return Ok(None);
        }

        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("sync already in progress, skipping");
            return Ok(None);
        };
        self.state.lock().last_sync = Some(now);

        let (booted, last_id, last_pruned) = {
            let state = self.state.lock();
            (state.booted, state.last_id, state.last_pruned)
        };

        if !booted {
            let result = self.boot_locked().await?;
            return Ok(Some(ProcessInstructionsResult::completed(
                0,
                result.last_id(),
            )));
        }

        if let Some(init) = self.check_backlog(last_id).await? {
            self.cold_boot(&init);
            self.adopt(init.last_id()).await?;
            return Ok(Some(ProcessInstructionsResult::completed(0, init.last_id())));
        }

        let role = self.role_provider.current_role();
        let result = self
            .service
            .process_instructions(
                &self.registry,
                role,
                &self.identity,
                last_pruned,
                last_id,
                cancellation,
            )
            .await?;

        self.adopt(result.last_id()).await?;
        if result.instructions_were_pruned() {
            self.state.lock().last_pruned = Some(now);
        }
        if result.number_of_instructions_processed() > 0 {
            debug!(
                n_instructions = result.number_of_instructions_processed(),
                last_id = %result.last_id(),
                %role,
                "processed cache instructions"
            );
        }
        Ok(Some(result))
    }

    /// Whether a booted server at `last_id` can no longer replay and has to cold boot.
    ///
    /// Unlike at boot, a watermark of zero alone is not a reason to cold boot here: it means the
    /// log was empty when this server booted, so everything in it is new unless the first records
    /// were pruned since.
    async fn check_backlog(&self, last_id: InstructionId) -> Result<Option<InitializationResult>> {
        let max_id = self.service.get_max_instruction_id().await?;

        if self.service.is_history_pruned(last_id).await? {
            warn!(
                %last_id,
                %max_id,
                "last synced instruction is no longer in the log, cold boot required"
            );
            return Ok(Some(InitializationResult::initialized(true, max_id, max_id)));
        }

        if self.config.cold_boot_allowed {
            let limit = self.service.config().max_processing_instruction_count;
            let (over_limit, count) = self
                .service
                .is_instruction_count_over_limit(last_id, limit)
                .await?;
            if over_limit {
                warn!(
                    record_count = count,
                    max_processing_instruction_count = limit,
                    "record backlog exceeds the processing limit, cold boot required"
                );
                return Ok(Some(InitializationResult::initialized(true, max_id, max_id)));
            }
        }

        Ok(None)
    }

    /// Apply `instructions` to the local caches, then append them to the log for the other
    /// servers.
    pub async fn distribute(
        &self,
        instructions: Vec<RefreshInstruction>,
    ) -> Result<Vec<InstructionId>> {
        for instruction in &instructions {
            if let Err(error) = self.registry.dispatch(instruction) {
                error!(%error, "failed to apply local cache instruction");
            }
        }
        self.service
            .deliver_instructions_in_batches(instructions, &self.identity)
            .await
    }

    /// Call [`sync`](Self::sync) every `interval` until `shutdown` is cancelled or the server is
    /// released. Errors are logged and the next tick tries again.
    ///
    /// Cancelling `shutdown` also stops a running cycle after the record it is applying, the
    /// watermark is saved up to that record.
    pub fn spawn_background(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        let stop = self.released.child_token();

        // a cycle does not yield between records, so shutdown is forwarded from its own task
        let forward = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => forward.cancel(),
                _ = forward.cancelled() => {}
            }
        });

        tokio::spawn(async move {
            // ends the forwarding task with this one
            let _stop = stop.clone().drop_guard();
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match sync.sync_until(&stop).await {
                    Ok(Some(result)) if result.instructions_were_pruned() => {
                        info!(last_id = %result.last_id(), "pruned instruction log");
                    }
                    Ok(_) => {}
                    Err(error) => {
                        error!(
                            %error,
                            identity = %sync.identity,
                            last_id = %sync.last_id(),
                            "failed to sync cache instructions"
                        );
                    }
                }
            }
            debug!("cache sync background task stopped");
        })
    }

    /// Stop taking part in synchronisation and wait up to `timeout` for a running cycle to
    /// finish. Returns whether the server is idle.
    pub async fn release(&self, timeout: Duration) -> bool {
        self.released.cancel();
        match tokio::time::timeout(timeout, self.cycle.lock()).await {
            Ok(_cycle) => {
                info!(identity = %self.identity, last_id = %self.last_id(), "cache sync released");
                true
            }
            Err(_) => {
                warn!(?timeout, "cache sync cycle still running after release timeout");
                false
            }
        }
    }
}
