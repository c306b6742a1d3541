use std::sync::Arc;

use cachesync_clap_blocks::object_store::{ObjectStoreConfig, ParseError};
use cachesync_log::object_store::ObjectStoreInstructionLog;
use cachesync_service::{CacheInstructionConfig, CacheInstructionService, SystemProvider};

/// The instruction log the configured object store holds under its prefix.
pub(crate) fn instruction_log(
    config: &ObjectStoreConfig,
) -> Result<Arc<ObjectStoreInstructionLog>, ParseError> {
    let object_store = config.make_object_store()?;
    Ok(Arc::new(ObjectStoreInstructionLog::new(
        object_store,
        config.instruction_log_prefix.clone(),
    )))
}

pub(crate) fn instruction_service(
    config: &ObjectStoreConfig,
    instruction_config: CacheInstructionConfig,
) -> Result<CacheInstructionService, ParseError> {
    Ok(CacheInstructionService::new(
        instruction_log(config)?,
        Arc::new(SystemProvider::new()),
        instruction_config,
    ))
}
