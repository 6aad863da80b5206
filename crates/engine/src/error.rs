//! Error type returned by every public `EventLog` operation.

use cellstore::CellStoreError;
use codec::CodecError;
use std::io;
use thiserror::Error;

pub type Result<T, E = EventDbError> = std::result::Result<T, E>;

/// Offsets carried by these errors are block indexes unless the field name
/// says otherwise.
#[derive(Debug, Error)]
pub enum EventDbError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(CodecError),

    #[error(transparent)]
    CellStore(CellStoreError),

    #[error("checksum mismatch at block {offset}: expected {expected:#06x}, found {found:#06x}")]
    Checksum { expected: u16, found: u16, offset: u64 },

    /// Failure while replaying history, tagged with where it happened.
    /// `record_type` is `None` when the block header itself was unreadable.
    #[error("rescan failed at block {offset} (record type {record_type:?}): {source}")]
    Rescan {
        offset: u64,
        record_type: Option<u16>,
        #[source]
        source: Box<EventDbError>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cell id {cell_id} is too far beyond the cell map (len {map_len})")]
    CellMapOverflow { cell_id: u32, map_len: usize },

    #[error("direct writes are not allowed on a replication slave")]
    SlaveModeViolation,

    #[error("database is opened read-only")]
    ReadOnly,

    #[error("database is closed")]
    EngineClosed,

    /// Replay stopped before the end of the file.
    #[error("log replay ended at byte {replayed} but the file holds {file_size} bytes")]
    TruncatedLog { replayed: u64, file_size: u64 },

    #[error("listener failed: {0:#}")]
    Listener(anyhow::Error),
}

impl EventDbError {
    /// The innermost error, looking through any [`EventDbError::Rescan`]
    /// wrappers.
    pub fn root(&self) -> &EventDbError {
        match self {
            EventDbError::Rescan { source, .. } => source.root(),
            other => other,
        }
    }

    /// `true` if the root cause is a checksum mismatch.
    pub fn is_checksum(&self) -> bool {
        matches!(self.root(), EventDbError::Checksum { .. })
    }

    pub(crate) fn rescan(offset: u64, record_type: Option<u16>, source: EventDbError) -> Self {
        EventDbError::Rescan {
            offset,
            record_type,
            source: Box::new(source),
        }
    }
}

impl From<CodecError> for EventDbError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(e) => EventDbError::Io(e),
            CodecError::Checksum {
                expected,
                found,
                offset,
            } => EventDbError::Checksum {
                expected,
                found,
                offset,
            },
            CodecError::InvalidArgument(msg) => EventDbError::InvalidArgument(msg),
            other => EventDbError::Codec(other),
        }
    }
}

impl From<CellStoreError> for EventDbError {
    fn from(e: CellStoreError) -> Self {
        match e {
            CellStoreError::Io(e) => EventDbError::Io(e),
            CellStoreError::CellMapOverflow { cell_id, map_len } => {
                EventDbError::CellMapOverflow { cell_id, map_len }
            }
            CellStoreError::InvalidArgument(msg) => EventDbError::InvalidArgument(msg),
            other => EventDbError::CellStore(other),
        }
    }
}
