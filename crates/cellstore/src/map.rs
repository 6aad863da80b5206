use crate::CellStoreError;

/// Location of a cell's live frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSlot {
    /// Byte offset of the frame header.
    pub offset: u64,
    pub frame_len: u32,
    /// Body granules in use.
    pub length: u16,
}

/// Growable array indexed by cell id. Never persisted: it is rebuilt from
/// frame headers on open.
#[derive(Debug, Default, Clone)]
pub struct CellMap {
    slots: Vec<Option<CellSlot>>,
    live: usize,
}

impl CellMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots, live or not (one past the highest id seen). Not a
    /// cell count: see [`live_count`](Self::live_count).
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// True when no cell has a frame, even if slots were reserved.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of cells with a frame.
    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn get(&self, cell_id: u32) -> Option<CellSlot> {
        self.slots.get(cell_id as usize).copied().flatten()
    }

    /// Grows the map so `cell_id` is addressable.
    ///
    /// Fails with [`CellStoreError::CellMapOverflow`] when `cell_id` lies
    /// more than `max_gap` slots past the current end.
    pub fn ensure(&mut self, cell_id: u32, max_gap: u32) -> Result<(), CellStoreError> {
        self.check_gap(cell_id, max_gap)?;
        let idx = cell_id as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, None);
        }
        Ok(())
    }

    /// Like [`ensure`](Self::ensure) but without growing the map.
    pub fn check_gap(&self, cell_id: u32, max_gap: u32) -> Result<(), CellStoreError> {
        let idx = cell_id as usize;
        if idx >= self.slots.len() && idx - self.slots.len() > max_gap as usize {
            return Err(CellStoreError::CellMapOverflow {
                cell_id,
                map_len: self.slots.len(),
            });
        }
        Ok(())
    }

    /// Points `cell_id` at `slot` (or clears it), returning the previous slot.
    /// The id must already be addressable.
    pub fn set(&mut self, cell_id: u32, slot: Option<CellSlot>) -> Option<CellSlot> {
        let Some(entry) = self.slots.get_mut(cell_id as usize) else {
            return None;
        };
        let prev = std::mem::replace(entry, slot);
        match (prev.is_some(), entry.is_some()) {
            (false, true) => self.live += 1,
            (true, false) => self.live -= 1,
            _ => {}
        }
        prev
    }

    /// Live cells in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, CellSlot)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.map(|s| (id as u32, s)))
    }

    /// Highest id with a live frame.
    pub fn max_id(&self) -> Option<u32> {
        self.slots
            .iter()
            .rposition(Option::is_some)
            .map(|id| id as u32)
    }
}
