//! Show how far a server is behind the shared log.

use std::path::PathBuf;

use cachesync_clap_blocks::object_store::ObjectStoreConfig;
use cachesync_clap_blocks::sync::DEFAULT_WATERMARK_FILE;
use cachesync_id::InstructionId;
use cachesync_logging::cli::LoggingConfig;
use cachesync_service::service::DEFAULT_MAX_PROCESSING_INSTRUCTION_COUNT;
use cachesync_service::{CacheInstructionConfig, FileWatermarkStore, WatermarkStore};
use thiserror::Error;

use super::common::instruction_service;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Cannot parse object store config: {0}")]
    ObjectStoreParsing(#[from] cachesync_clap_blocks::object_store::ParseError),

    #[error("Cannot read watermark: {0}")]
    Watermark(#[from] cachesync_service::watermark::Error),

    #[error("Cannot read instruction log: {0}")]
    Log(#[from] cachesync_service::Error),
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// object store options
    #[clap(flatten)]
    object_store_config: ObjectStoreConfig,

    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// Watermark to report on. Read from `--watermark-file` when not given.
    #[clap(long = "last-id", action)]
    last_id: Option<InstructionId>,

    /// File holding the id of the last record a server applied.
    #[clap(
        long = "watermark-file",
        env = "CACHESYNC_WATERMARK_FILE",
        default_value = DEFAULT_WATERMARK_FILE,
        action
    )]
    watermark_file: PathBuf,

    /// A backlog of more records than this is not replayed, the server cold boots instead.
    /// Records are counted, not the instructions they hold.
    #[clap(
        long = "max-processing-instruction-count",
        env = "CACHESYNC_MAX_PROCESSING_INSTRUCTION_COUNT",
        default_value_t = DEFAULT_MAX_PROCESSING_INSTRUCTION_COUNT,
        action
    )]
    max_processing_instruction_count: u64,
}

pub(crate) async fn command(config: Config) -> Result<(), Error> {
    let last_id = match config.last_id {
        Some(last_id) => Some(last_id),
        None => {
            FileWatermarkStore::new(config.watermark_file)
                .load()
                .await?
        }
    };

    let service = instruction_service(
        &config.object_store_config,
        CacheInstructionConfig {
            max_processing_instruction_count: config.max_processing_instruction_count,
            ..Default::default()
        },
    )?;

    let max_id = service.get_max_instruction_id().await?;
    println!("max instruction id: {max_id}");

    let Some(last_id) = last_id else {
        println!("last synced instruction id: never synced");
        println!("cold boot required: true");
        return Ok(());
    };

    let (over_limit, backlog) = service
        .is_instruction_count_over_limit(last_id, config.max_processing_instruction_count)
        .await?;
    let missing = service.is_cold_boot_required(last_id).await?;
    println!("last synced instruction id: {last_id}");
    println!("instructions behind: {backlog}");
    println!("last synced instruction missing: {missing}");
    println!("cold boot required: {}", missing || over_limit);
    Ok(())
}
