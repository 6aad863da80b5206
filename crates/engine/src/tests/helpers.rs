use crate::*;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Everything a listener can observe, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StartRescan,
    Update {
        offset: u64,
        timestamp: u32,
        record_type: u16,
        payload: Vec<u8>,
    },
    Cell {
        cell_id: u32,
        offset: u64,
        timestamp: u32,
        record_type: u16,
        payload: Vec<u8>,
    },
    EndRescan,
}

#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<Event>>,
    pub released: AtomicBool,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// `(timestamp, record_type, payload)` of every log update.
    pub fn updates(&self) -> Vec<(u32, u16, Vec<u8>)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Update {
                    timestamp,
                    record_type,
                    payload,
                    ..
                } => Some((*timestamp, *record_type, payload.clone())),
                _ => None,
            })
            .collect()
    }

    /// `(cell_id, record_type, payload)` of every cell update.
    pub fn cells(&self) -> Vec<(u32, u16, Vec<u8>)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Cell {
                    cell_id,
                    record_type,
                    payload,
                    ..
                } => Some((*cell_id, *record_type, payload.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Listener for RecordingListener {
    fn on_start_rescan(&self) -> anyhow::Result<()> {
        self.events.lock().push(Event::StartRescan);
        Ok(())
    }

    fn on_update(&self, offset: u64, timestamp: u32, record_type: u16, payload: &[u8]) -> anyhow::Result<()> {
        self.events.lock().push(Event::Update {
            offset,
            timestamp,
            record_type,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn on_update_cell(
        &self,
        cell_id: u32,
        offset: u64,
        timestamp: u32,
        record_type: u16,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        self.events.lock().push(Event::Cell {
            cell_id,
            offset,
            timestamp,
            record_type,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn on_end_rescan(&self) -> anyhow::Result<()> {
        self.events.lock().push(Event::EndRescan);
        Ok(())
    }

    fn on_release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Accepts the first `budget` updates (log or cell), then fails every one.
pub struct FailingListener {
    budget: AtomicUsize,
    pub released: AtomicBool,
}

impl FailingListener {
    pub fn after(budget: usize) -> Arc<Self> {
        Arc::new(Self {
            budget: AtomicUsize::new(budget),
            released: AtomicBool::new(false),
        })
    }

    fn take(&self) -> anyhow::Result<()> {
        self.budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("listener refused the record"))
    }
}

impl Listener for FailingListener {
    fn on_update(&self, _offset: u64, _timestamp: u32, _record_type: u16, _payload: &[u8]) -> anyhow::Result<()> {
        self.take()
    }

    fn on_update_cell(
        &self,
        _cell_id: u32,
        _offset: u64,
        _timestamp: u32,
        _record_type: u16,
        _payload: &[u8],
    ) -> anyhow::Result<()> {
        self.take()
    }

    fn on_release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Writable config with a fixed seed and no fsync, for speed.
pub fn test_config(path: &Path) -> EventDbConfig {
    EventDbConfig::new(path).with_sync(false).with_rng_seed(42)
}
