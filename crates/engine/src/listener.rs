//! The listener API, the only extension point of the engine.

use anyhow::Result;
use std::fmt;
use std::sync::Arc;

/// Receives every record appended to (or replayed from) an `EventLog`.
///
/// Callbacks run on the writing thread while the writer lock is held, so they
/// must not call back into the same `EventLog`. An `Err` from
/// [`on_update`](Self::on_update) or [`on_update_cell`](Self::on_update_cell)
/// during a commit rolls the write back and closes the database.
pub trait Listener: Send + Sync {
    fn on_start_rescan(&self) -> Result<()> {
        Ok(())
    }

    /// A log record. `offset` is the record's block index.
    fn on_update(&self, offset: u64, timestamp: u32, record_type: u16, payload: &[u8])
        -> Result<()>;

    /// A cell value. `offset` is the block index of the cell's frame.
    fn on_update_cell(
        &self,
        _cell_id: u32,
        _offset: u64,
        _timestamp: u32,
        _record_type: u16,
        _payload: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    fn on_end_rescan(&self) -> Result<()> {
        Ok(())
    }

    /// Called once when the listener is unregistered or the database closes.
    fn on_release(&self) {}
}

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

pub(crate) type Registered = Vec<(ListenerId, Arc<dyn Listener>)>;
