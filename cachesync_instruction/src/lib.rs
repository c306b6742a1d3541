//! The data model of the cache instruction log.
//!
//! A [`RefreshInstruction`] tells one cache refresher to do one thing: drop everything, refresh
//! some entities, remove some entities, or apply an opaque payload. Instructions are appended to
//! the shared log in batches; each row of the log is an [`InstructionBatchRecord`] whose
//! instructions are stored serialized so that a batch written by a newer server that cannot be
//! decoded here can be skipped without poisoning the rest of the log.

pub mod chunk;

use std::sync::Arc;

use cachesync_id::{EntityId, InstructionId, RefresherId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use chunk::chunk_instructions;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to serialize instructions: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize instructions: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("payload is not valid: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("too many instructions in a single batch: {0}")]
    TooManyInstructions(usize),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a refresher should interpret an instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefreshType {
    RefreshAll,
    RefreshByPayload,
    RefreshByIds,
    RemoveByIds,
}

impl std::fmt::Display for RefreshType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RefreshAll => write!(f, "refresh_all"),
            Self::RefreshByPayload => write!(f, "refresh_by_payload"),
            Self::RefreshByIds => write!(f, "refresh_by_ids"),
            Self::RemoveByIds => write!(f, "remove_by_ids"),
        }
    }
}

/// Opaque, already serialized data that only the target refresher knows how to read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(String);

impl Payload {
    /// Serialize `value` as JSON into a new payload.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        serde_json::to_string(value)
            .map(Self)
            .map_err(Error::Payload)
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the payload as JSON into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.0).map_err(Error::Payload)
    }
}

/// The operation carried by a [`RefreshInstruction`], together with the data it needs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "refresh_type", content = "payload")]
pub enum RefreshOperation {
    RefreshAll,
    RefreshByPayload(Payload),
    RefreshByIds(Vec<EntityId>),
    RemoveByIds(Vec<EntityId>),
}

impl RefreshOperation {
    pub fn refresh_type(&self) -> RefreshType {
        match self {
            Self::RefreshAll => RefreshType::RefreshAll,
            Self::RefreshByPayload(_) => RefreshType::RefreshByPayload,
            Self::RefreshByIds(_) => RefreshType::RefreshByIds,
            Self::RemoveByIds(_) => RefreshType::RemoveByIds,
        }
    }
}

/// "Refresher X, do operation Y with payload Z."
///
/// Instructions must be idempotent: applying one twice has the same effect as applying it once.
/// The catch-up loop relies on this, a record may be replayed after a crash that happened before
/// the watermark was advanced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefreshInstruction {
    pub refresher_id: RefresherId,
    pub operation: RefreshOperation,
}

impl RefreshInstruction {
    pub fn new(refresher_id: RefresherId, operation: RefreshOperation) -> Self {
        Self {
            refresher_id,
            operation,
        }
    }

    pub fn refresh_all(refresher_id: RefresherId) -> Self {
        Self::new(refresher_id, RefreshOperation::RefreshAll)
    }

    pub fn refresh_by_payload(refresher_id: RefresherId, payload: Payload) -> Self {
        Self::new(refresher_id, RefreshOperation::RefreshByPayload(payload))
    }

    pub fn refresh_by_ids(
        refresher_id: RefresherId,
        ids: impl IntoIterator<Item = impl Into<EntityId>>,
    ) -> Self {
        Self::new(
            refresher_id,
            RefreshOperation::RefreshByIds(ids.into_iter().map(Into::into).collect()),
        )
    }

    pub fn remove_by_ids(
        refresher_id: RefresherId,
        ids: impl IntoIterator<Item = impl Into<EntityId>>,
    ) -> Self {
        Self::new(
            refresher_id,
            RefreshOperation::RemoveByIds(ids.into_iter().map(Into::into).collect()),
        )
    }

    pub fn refresh_type(&self) -> RefreshType {
        self.operation.refresh_type()
    }
}

/// Older writers nested the instructions for one refresher in their own array, so reading
/// accepts arbitrarily nested arrays and flattens them in order.
#[derive(Deserialize)]
#[serde(untagged)]
enum InstructionItem {
    One(RefreshInstruction),
    Many(Vec<InstructionItem>),
}

fn flatten_into(items: Vec<InstructionItem>, out: &mut Vec<RefreshInstruction>) {
    for item in items {
        match item {
            InstructionItem::One(instruction) => out.push(instruction),
            InstructionItem::Many(nested) => flatten_into(nested, out),
        }
    }
}

/// The instructions of one log row in their stored form: a JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerializedInstructions(Arc<str>);

impl SerializedInstructions {
    pub fn serialize(instructions: &[RefreshInstruction]) -> Result<Self> {
        let json = serde_json::to_string(instructions).map_err(Error::Serialize)?;
        Ok(Self(json.into()))
    }

    /// Wrap raw text read back from a store without looking at it.
    pub fn from_raw(raw: impl Into<Arc<str>>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn deserialize(&self) -> Result<Vec<RefreshInstruction>> {
        let items: Vec<InstructionItem> =
            serde_json::from_str(&self.0).map_err(Error::Deserialize)?;
        let mut instructions = Vec::with_capacity(items.len());
        flatten_into(items, &mut instructions);
        Ok(instructions)
    }
}

/// A batch of instructions that has not been appended to the log yet, so has no id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstructionBatch {
    pub utc_timestamp: DateTime<Utc>,
    pub origin_identity: Arc<str>,
    pub instruction_count: u32,
    pub instructions: SerializedInstructions,
}

impl NewInstructionBatch {
    pub fn new(
        utc_timestamp: DateTime<Utc>,
        origin_identity: impl Into<Arc<str>>,
        instructions: &[RefreshInstruction],
    ) -> Result<Self> {
        let instruction_count = u32::try_from(instructions.len())
            .map_err(|_| Error::TooManyInstructions(instructions.len()))?;
        Ok(Self {
            utc_timestamp,
            origin_identity: origin_identity.into(),
            instruction_count,
            instructions: SerializedInstructions::serialize(instructions)?,
        })
    }

    /// Attach the id the store assigned when appending this batch.
    pub fn into_record(self, id: InstructionId) -> InstructionBatchRecord {
        InstructionBatchRecord {
            id,
            utc_timestamp: self.utc_timestamp,
            origin_identity: self.origin_identity,
            instruction_count: self.instruction_count,
            instructions: self.instructions,
        }
    }
}

/// One row of the instruction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionBatchRecord {
    /// Assigned by the store, strictly increasing.
    pub id: InstructionId,
    /// Only used to decide what is old enough to prune, never for ordering.
    pub utc_timestamp: DateTime<Utc>,
    /// Identity of the server process that appended the row.
    pub origin_identity: Arc<str>,
    pub instruction_count: u32,
    pub instructions: SerializedInstructions,
}

impl InstructionBatchRecord {
    pub fn is_from(&self, identity: &str) -> bool {
        self.origin_identity.as_ref() == identity
    }
}
