//! Identifier types shared by the instruction log, the refreshers and the sync service.

use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid instruction id: {0:?}")]
    InvalidInstructionId(String),

    #[error("invalid refresher id: {0}")]
    InvalidRefresherId(#[from] uuid::Error),
}

/// The id of a row in the instruction log.
///
/// Ids are assigned by the log store, never by callers, and strictly increase with every append.
/// A server uses the id of the last row it fully applied as its watermark. `0` is never assigned
/// to a row and stands for "nothing applied yet".
#[derive(
    Debug, Default, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash,
)]
pub struct InstructionId(u64);

impl InstructionId {
    pub const NONE: Self = Self(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The id after this one, `None` once the id space is exhausted.
    pub fn next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// The id `distance` rows behind this one, bottoming out at [`InstructionId::NONE`].
    pub fn saturating_sub(&self, distance: u64) -> Self {
        Self(self.0.saturating_sub(distance))
    }
}

impl From<u64> for InstructionId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for InstructionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstructionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|_| Error::InvalidInstructionId(s.to_string()))
    }
}

/// Stable identifier of a cache refresher.
///
/// Every server in the farm must register a given refresher under the same id, otherwise the
/// instructions it produces cannot be resolved elsewhere.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct RefresherId(Uuid);

impl RefresherId {
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for RefresherId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl Display for RefresherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for RefresherId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// The id of an entity held in a local cache, as carried by id based refresh instructions.
///
/// Entities are keyed either by an integer or by a UUID.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Uuid(Uuid),
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        Self::Uuid(value)
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Uuid(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for EntityId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(id) = s.parse::<i64>() {
            return Ok(Self::Int(id));
        }
        Ok(Self::Uuid(Uuid::parse_str(s)?))
    }
}
