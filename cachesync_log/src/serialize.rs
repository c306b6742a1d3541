//! Framing for instruction batches stored as individual objects.
//!
//! Each object starts with a file type identifier, followed by a big-endian crc32 checksum of
//! the body and the JSON encoded body itself.

use byteorder::{BigEndian, ReadBytesExt};
use bytes::Bytes;
use cachesync_instruction::SerializedInstructions;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::mem::size_of;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid instruction batch file identifier")]
    InvalidFileType,

    #[error("crc32 checksum mismatch")]
    Crc32Mismatch,

    #[error("Serde error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

/// The first bytes written into a batch file to identify it and its version.
const FILE_TYPE_IDENTIFIER: &[u8] = b"csync001";

const CHECKSUM_LEN: usize = size_of::<u32>();

/// The body of a stored batch. The id is not part of it, it is the name of the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBatch {
    pub utc_timestamp: DateTime<Utc>,
    pub origin_identity: Arc<str>,
    pub instruction_count: u32,
    pub instructions: SerializedInstructions,
}

pub fn verify_file_type_and_deserialize(b: Bytes) -> Result<StoredBatch> {
    let pos = FILE_TYPE_IDENTIFIER.len();
    if b.len() < pos + CHECKSUM_LEN || &b[..pos] != FILE_TYPE_IDENTIFIER {
        return Err(Error::InvalidFileType);
    }

    let mut cursor = Cursor::new(&b[pos..pos + CHECKSUM_LEN]);
    let crc32_checksum = cursor.read_u32::<BigEndian>()?;

    let data = &b[pos + CHECKSUM_LEN..];
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    if hasher.finalize() != crc32_checksum {
        return Err(Error::Crc32Mismatch);
    }

    Ok(serde_json::from_slice(data)?)
}

pub fn serialize_to_file_bytes(batch: &StoredBatch) -> Result<Vec<u8>> {
    let data = serde_json::to_vec(batch)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data);
    let checksum = hasher.finalize();

    let mut buf = Vec::with_capacity(FILE_TYPE_IDENTIFIER.len() + CHECKSUM_LEN + data.len());
    buf.extend_from_slice(FILE_TYPE_IDENTIFIER);
    buf.extend_from_slice(&checksum.to_be_bytes());
    buf.extend_from_slice(&data);

    Ok(buf)
}
