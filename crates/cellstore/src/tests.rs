use super::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::fs;
use tempfile::tempdir;

const GAP: u32 = config::DEFAULT_MAX_CELL_GAP;

fn rng() -> SmallRng {
    SmallRng::seed_from_u64(9)
}

// -------------------- Frame header --------------------

#[test]
fn frame_header_encode_decode() {
    let h = FrameHeader {
        frame_len: 40,
        cell_id: 3,
        length: 2,
        record_type: 11,
        timestamp: 0xDEAD_BEEF,
    };
    assert_eq!(FrameHeader::decode(&h.encode()), h);
    assert_eq!(h.capacity(), 3);
    assert!(h.validate().is_ok());
}

#[test]
fn frame_header_validation() {
    let ok = FrameHeader {
        frame_len: 24,
        cell_id: 1,
        length: 1,
        record_type: 0,
        timestamp: 0,
    };
    assert!(FrameHeader { frame_len: 20, ..ok }.validate().is_err());
    assert!(FrameHeader { frame_len: 16, ..ok }.validate().is_err());
    assert!(FrameHeader { cell_id: 0, ..ok }.validate().is_err());
    assert!(FrameHeader { length: 2, ..ok }.validate().is_err());
}

// -------------------- Cell map --------------------

#[test]
fn map_grows_within_gap() {
    let mut m = CellMap::new();
    m.ensure(5, 10).unwrap();
    assert_eq!(m.slot_count(), 6);
    assert_eq!(m.live_count(), 0);
    assert!(m.is_empty());
    assert!(m.get(5).is_none());

    let slot = CellSlot {
        offset: 0,
        frame_len: 24,
        length: 1,
    };
    m.set(5, Some(slot));
    assert!(!m.is_empty());
    assert_eq!(m.live_count(), 1);
    m.set(5, None);
    assert!(m.is_empty());
    assert_eq!(m.slot_count(), 6);
}

#[test]
fn map_rejects_huge_gap() {
    let mut m = CellMap::new();
    m.ensure(10, 10).unwrap();
    let err = m.ensure(100, 10).unwrap_err();
    assert!(matches!(
        err,
        CellStoreError::CellMapOverflow { cell_id: 100, map_len: 11 }
    ));
}

#[test]
fn map_tracks_live_cells() {
    let mut m = CellMap::new();
    m.ensure(3, GAP).unwrap();
    let slot = CellSlot {
        offset: 0,
        frame_len: 24,
        length: 1,
    };
    assert!(m.set(1, Some(slot)).is_none());
    m.set(3, Some(slot));
    assert_eq!(m.live_count(), 2);
    assert_eq!(m.max_id(), Some(3));
    assert_eq!(m.iter().map(|(id, _)| id).collect::<Vec<_>>(), vec![1, 3]);
    assert_eq!(m.set(3, None), Some(slot));
    assert_eq!(m.live_count(), 1);
}

// -------------------- Writes --------------------

#[test]
fn write_then_read_cell() {
    let dir = tempdir().unwrap();
    let mut store = CellStore::open(dir.path().join("db.cells"), false).unwrap();

    let w = store.write(1, 7, b"hello", 100, GAP, &mut rng()).unwrap();
    assert!(w.relocated);
    assert_eq!(w.offset, 0);

    let v = store.read_cell(1).unwrap().unwrap();
    assert_eq!(v.payload, b"hello");
    assert_eq!(v.record_type, 7);
    assert_eq!(v.timestamp, 100);
    assert_eq!(store.size(), 24);
    assert!(store.read_cell(2).unwrap().is_none());
}

#[test]
fn smaller_value_overwrites_in_place() {
    let dir = tempdir().unwrap();
    let mut store = CellStore::open(dir.path().join("db.cells"), false).unwrap();
    let mut rng = rng();

    store.write(1, 1, &[b'a'; 20], 1, GAP, &mut rng).unwrap();
    let size = store.size();
    let w = store.write(1, 1, b"tiny", 2, GAP, &mut rng).unwrap();

    assert!(!w.relocated);
    assert_eq!(w.offset, 0);
    assert_eq!(store.size(), size);
    assert_eq!(store.read_cell(1).unwrap().unwrap().payload, b"tiny");

    // Frame keeps its capacity, so growing back to 20 bytes still fits.
    let w = store.write(1, 1, &[b'b'; 20], 3, GAP, &mut rng).unwrap();
    assert!(!w.relocated);
}

#[test]
fn larger_value_relocates_to_end() {
    let dir = tempdir().unwrap();
    let mut store = CellStore::open(dir.path().join("db.cells"), false).unwrap();
    let mut rng = rng();

    store.write(1, 1, b"x", 1, GAP, &mut rng).unwrap();
    store.write(2, 1, b"y", 1, GAP, &mut rng).unwrap();
    let end = store.size();

    let w = store.write(1, 1, &[b'z'; 50], 2, GAP, &mut rng).unwrap();
    assert!(w.relocated);
    assert!(w.offset * config::BLOCK_SIZE >= end);
    assert_eq!(store.map().get(1).unwrap().offset, end);
    assert_eq!(store.read_cell(1).unwrap().unwrap().payload, vec![b'z'; 50]);
    assert_eq!(store.read_cell(2).unwrap().unwrap().payload, b"y");
}

#[test]
fn cell_zero_is_reserved() {
    let dir = tempdir().unwrap();
    let mut store = CellStore::open(dir.path().join("db.cells"), false).unwrap();
    let err = store.write(0, 1, b"x", 1, GAP, &mut rng()).unwrap_err();
    assert!(matches!(err, CellStoreError::InvalidArgument(_)));
    assert_eq!(store.size(), 0);
}

#[test]
fn gap_overflow_rejected_before_io() {
    let dir = tempdir().unwrap();
    let mut store = CellStore::open(dir.path().join("db.cells"), false).unwrap();
    let err = store.write(50, 1, b"x", 1, 10, &mut rng()).unwrap_err();
    assert!(matches!(err, CellStoreError::CellMapOverflow { .. }));
    assert_eq!(store.size(), 0);
}

// -------------------- Rollback --------------------

#[test]
fn rollback_restores_overwritten_frame() {
    let dir = tempdir().unwrap();
    let mut store = CellStore::open(dir.path().join("db.cells"), false).unwrap();
    let mut rng = rng();

    store.write(1, 1, b"original", 1, GAP, &mut rng).unwrap();
    let w = store.write(1, 2, b"newer", 2, GAP, &mut rng).unwrap();
    store.rollback(w.undo).unwrap();

    let v = store.read_cell(1).unwrap().unwrap();
    assert_eq!(v.payload, b"original");
    assert_eq!(v.record_type, 1);
}

#[test]
fn rollback_truncates_relocated_frame() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.cells");
    let mut store = CellStore::open(&path, false).unwrap();
    let mut rng = rng();

    store.write(1, 1, b"a", 1, GAP, &mut rng).unwrap();
    let size = store.size();
    let w = store.write(1, 1, &[0u8; 100], 2, GAP, &mut rng).unwrap();
    store.rollback(w.undo).unwrap();

    assert_eq!(store.size(), size);
    assert_eq!(fs::metadata(&path).unwrap().len(), size);
    assert_eq!(store.map().get(1).unwrap().offset, 0);
    assert_eq!(store.read_cell(1).unwrap().unwrap().payload, b"a");
}

// -------------------- Scan --------------------

#[test]
fn scan_rebuilds_map_with_latest_frames() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.cells");
    {
        let mut store = CellStore::open(&path, false).unwrap();
        let mut rng = rng();
        store.write(1, 1, b"one", 1, GAP, &mut rng).unwrap();
        store.write(2, 1, b"two", 1, GAP, &mut rng).unwrap();
        store.write(1, 1, &[b'1'; 40], 2, GAP, &mut rng).unwrap(); // relocates
        store.write(2, 1, b"2", 3, GAP, &mut rng).unwrap(); // in place
    }

    let mut store = CellStore::open(&path, true).unwrap();
    store.scan(GAP).unwrap();
    assert_eq!(store.map().live_count(), 2);
    assert_eq!(store.read_cell(1).unwrap().unwrap().payload, vec![b'1'; 40]);
    let two = store.read_cell(2).unwrap().unwrap();
    assert_eq!(two.payload, b"2");
    assert_eq!(two.timestamp, 3);
}

#[test]
fn scan_rejects_truncated_frame() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db.cells");
    {
        let mut store = CellStore::open(&path, false).unwrap();
        store.write(1, 1, &[7u8; 30], 1, GAP, &mut rng()).unwrap();
    }
    let data = fs::read(&path).unwrap();
    fs::write(&path, &data[..data.len() - 8]).unwrap();

    let mut store = CellStore::open(&path, false).unwrap();
    assert!(matches!(
        store.scan(GAP),
        Err(CellStoreError::Corrupt { offset: 0, .. })
    ));
}

#[test]
fn read_only_open_requires_file() {
    let dir = tempdir().unwrap();
    assert!(CellStore::open(dir.path().join("missing.cells"), true).is_err());
}
