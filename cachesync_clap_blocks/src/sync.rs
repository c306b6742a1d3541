//! CLI config for the catch-up cycle of a server.

use std::{num::NonZeroUsize, path::PathBuf, time::Duration};

use cachesync_service::{CacheInstructionConfig, CacheSyncConfig, RetentionPolicy, ServerRole};

/// The default location of the file holding the id of the last applied record.
pub const DEFAULT_WATERMARK_FILE: &str = ".cachesync/lastsynced";

/// CLI config for keeping the caches of one server in sync with the farm.
#[derive(Debug, Clone, clap::Parser)]
pub struct SyncConfig {
    /// Name of this server, part of the identity stamped on every record it appends.
    #[clap(
        long = "server-name",
        env = "CACHESYNC_SERVER_NAME",
        default_value = "cachesync",
        action
    )]
    pub server_name: String,

    /// Role of this server in the farm: single, scheduling-publisher, publisher, subscriber or
    /// unknown. Only single and scheduling-publisher servers prune the log.
    #[clap(long = "role", env = "CACHESYNC_ROLE", default_value = "single", action)]
    pub role: ServerRole,

    /// How often the background task looks for new instructions.
    #[clap(
        long = "sync-interval",
        env = "CACHESYNC_SYNC_INTERVAL",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub sync_interval: Duration,

    /// Minimum time between two catch-up cycles, however they are triggered.
    #[clap(
        long = "sync-throttle",
        env = "CACHESYNC_SYNC_THROTTLE",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub throttle: Duration,

    /// Minimum time between two prunes of the log.
    #[clap(
        long = "prune-interval",
        env = "CACHESYNC_PRUNE_INTERVAL",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub prune_interval: Duration,

    /// Records older than this are pruned. Must cover the longest time a server of the farm may
    /// be down and still catch up without a cold boot.
    #[clap(
        long = "retention-max-age",
        env = "CACHESYNC_RETENTION_MAX_AGE",
        default_value = "2days",
        value_parser = humantime::parse_duration
    )]
    pub retention_max_age: Duration,

    /// Prune records more than this many ids behind the newest one instead of by age.
    #[clap(
        long = "retention-id-distance",
        env = "CACHESYNC_RETENTION_ID_DISTANCE",
        action
    )]
    pub retention_id_distance: Option<u64>,

    /// How many records are read from the log at a time while catching up.
    #[clap(
        long = "page-size",
        env = "CACHESYNC_PAGE_SIZE",
        default_value = "100",
        action
    )]
    pub page_size: NonZeroUsize,

    /// The most instructions a single appended record holds.
    #[clap(
        long = "max-instructions-per-batch",
        env = "CACHESYNC_MAX_INSTRUCTIONS_PER_BATCH",
        default_value = "1000",
        action
    )]
    pub max_instructions_per_batch: NonZeroUsize,

    /// A backlog of more records than this is not replayed, the server cold boots instead.
    /// Records are counted, not the instructions they hold.
    #[clap(
        long = "max-processing-instruction-count",
        env = "CACHESYNC_MAX_PROCESSING_INSTRUCTION_COUNT",
        default_value = "1000",
        action
    )]
    pub max_processing_instruction_count: u64,

    /// Replay a backlog of any size instead of cold booting when it is over
    /// `--max-processing-instruction-count`.
    #[clap(
        long = "disable-backlog-cold-boot",
        env = "CACHESYNC_DISABLE_BACKLOG_COLD_BOOT",
        default_value_t = false,
        action
    )]
    pub disable_backlog_cold_boot: bool,

    /// How long shutdown waits for a running catch-up cycle to finish.
    #[clap(
        long = "release-timeout",
        env = "CACHESYNC_RELEASE_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub release_timeout: Duration,

    /// File holding the id of the last record this server applied.
    #[clap(
        long = "watermark-file",
        env = "CACHESYNC_WATERMARK_FILE",
        default_value = DEFAULT_WATERMARK_FILE,
        action
    )]
    pub watermark_file: PathBuf,
}

impl SyncConfig {
    pub fn retention(&self) -> RetentionPolicy {
        match self.retention_id_distance {
            Some(distance) => RetentionPolicy::IdDistance(distance),
            None => RetentionPolicy::MaxAge(self.retention_max_age),
        }
    }

    pub fn instruction_config(&self) -> CacheInstructionConfig {
        CacheInstructionConfig {
            max_instructions_per_batch: self.max_instructions_per_batch,
            page_size: self.page_size,
            max_processing_instruction_count: self.max_processing_instruction_count,
            prune_interval: self.prune_interval,
            retention: self.retention(),
        }
    }

    pub fn sync_config(&self) -> CacheSyncConfig {
        CacheSyncConfig {
            throttle: self.throttle,
            cold_boot_allowed: !self.disable_backlog_cold_boot,
        }
    }
}
