//! Append one refresh instruction to the shared log, as a server would after changing data.

use cachesync_clap_blocks::object_store::ObjectStoreConfig;
use cachesync_id::{EntityId, RefresherId};
use cachesync_instruction::{Payload, RefreshInstruction};
use cachesync_logging::cli::LoggingConfig;
use cachesync_service::{CacheInstructionConfig, LocalIdentity};
use thiserror::Error;
use tracing::debug;

use super::common::instruction_service;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Cannot parse object store config: {0}")]
    ObjectStoreParsing(#[from] cachesync_clap_blocks::object_store::ParseError),

    #[error("Payload is not valid JSON: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Delivery failed: {0}")]
    Deliver(#[from] cachesync_service::Error),
}

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    /// object store options
    #[clap(flatten)]
    object_store_config: ObjectStoreConfig,

    /// logging options
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// Name the record is stamped with. Servers apply every record they did not append
    /// themselves, so any name works.
    #[clap(
        long = "server-name",
        env = "CACHESYNC_SERVER_NAME",
        default_value = "cachesync-cli",
        action
    )]
    server_name: String,

    /// Id of the cache refresher the instruction is addressed to.
    #[clap(long = "refresher", action)]
    refresher_id: RefresherId,

    #[clap(flatten)]
    operation: Operation,
}

/// Exactly one of these is required.
#[derive(Debug, clap::Args)]
#[group(required = true, multiple = false)]
struct Operation {
    /// Drop or reload everything the refresher caches.
    #[clap(long = "refresh-all", action)]
    refresh_all: bool,

    /// Reload the entities with these ids (integers or UUIDs, comma separated).
    #[clap(long = "refresh-ids", value_delimiter = ',', action = clap::ArgAction::Append)]
    refresh_ids: Vec<EntityId>,

    /// Evict the entities with these ids (integers or UUIDs, comma separated).
    #[clap(long = "remove-ids", value_delimiter = ',', action = clap::ArgAction::Append)]
    remove_ids: Vec<EntityId>,

    /// Refresh with a refresher specific JSON payload.
    #[clap(long = "payload", action)]
    payload: Option<String>,
}

impl Operation {
    fn into_instruction(self, refresher_id: RefresherId) -> Result<RefreshInstruction, Error> {
        let Self {
            refresh_all,
            refresh_ids,
            remove_ids,
            payload,
        } = self;

        Ok(if let Some(payload) = payload {
            // only checked for well-formedness, the refresher decodes it
            serde_json::from_str::<serde_json::Value>(&payload)?;
            RefreshInstruction::refresh_by_payload(refresher_id, Payload::from_raw(payload))
        } else if !refresh_ids.is_empty() {
            RefreshInstruction::refresh_by_ids(refresher_id, refresh_ids)
        } else if !remove_ids.is_empty() {
            RefreshInstruction::remove_by_ids(refresher_id, remove_ids)
        } else {
            debug_assert!(refresh_all);
            RefreshInstruction::refresh_all(refresher_id)
        })
    }
}

pub(crate) async fn command(config: Config) -> Result<(), Error> {
    let Config {
        object_store_config,
        logging_config: _,
        server_name,
        refresher_id,
        operation,
    } = config;

    let instruction = operation.into_instruction(refresher_id)?;
    let service = instruction_service(&object_store_config, CacheInstructionConfig::default())?;
    let identity = LocalIdentity::new(&server_name);
    debug!(%identity, ?instruction, "delivering instruction");

    let ids = service.deliver_instructions(&[instruction], &identity).await?;
    for id in ids {
        println!("delivered instruction batch {id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachesync_instruction::RefreshOperation;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    const CONTENT: &str = "1f0c6a54-5e2b-4a59-8a5e-3c1d8f7b9a10";

    fn parse(args: &[&str]) -> Result<Config, clap::Error> {
        let mut argv = vec![
            "deliver",
            "--object-store",
            "memory",
            "--refresher",
            CONTENT,
        ];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv)
    }

    fn operation(args: &[&str]) -> RefreshOperation {
        let config = parse(args).unwrap();
        config
            .operation
            .into_instruction(config.refresher_id)
            .unwrap()
            .operation
    }

    #[test]
    fn one_operation_is_required() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--refresh-all", "--remove-ids", "1"]).is_err());
    }

    #[test]
    fn operations() {
        assert_eq!(operation(&["--refresh-all"]), RefreshOperation::RefreshAll);
        assert_eq!(
            operation(&["--refresh-ids", "1,2", "--refresh-ids", "3"]),
            RefreshOperation::RefreshByIds(vec![
                EntityId::Int(1),
                EntityId::Int(2),
                EntityId::Int(3)
            ])
        );
        assert_eq!(
            operation(&["--remove-ids", CONTENT]),
            RefreshOperation::RemoveByIds(vec![EntityId::Uuid(CONTENT.parse().unwrap())])
        );
        assert_eq!(
            operation(&["--payload", r#"{"ids":[1]}"#]),
            RefreshOperation::RefreshByPayload(Payload::from_raw(r#"{"ids":[1]}"#))
        );
    }

    #[test]
    fn payload_must_be_json() {
        let config = parse(&["--payload", "{not json"]).unwrap();
        assert!(matches!(
            config.operation.into_instruction(config.refresher_id),
            Err(Error::InvalidPayload(_))
        ));
    }
}
