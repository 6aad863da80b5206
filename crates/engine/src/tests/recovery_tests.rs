use super::helpers::{test_config, Event, RecordingListener};
use crate::*;
use anyhow::Result;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn write_records(path: &Path, records: &[(u16, &[u8], u32)]) -> Result<()> {
    let db = EventLog::open(test_config(path))?;
    let mut trn = db.transaction()?;
    for &(record_type, payload, time) in records {
        trn.send_update(record_type, payload, time)?;
    }
    trn.commit();
    Ok(())
}

fn rescan_config(path: &Path) -> EventDbConfig {
    test_config(path).with_flags(OpenFlags::NONE.rescan())
}

// --------------------- Reopen ---------------------

#[test]
fn reopen_restores_writer_state() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    let before = {
        let db = EventLog::open(test_config(&path))?;
        db.send_update(1, b"a", 10)?;
        db.send_update(2, b"bb", 20)?;
        db.send_update(3, b"ccc", 100_000)?;
        db.stats()?
    };

    {
        let db = EventLog::open(test_config(&path))?;
        assert_eq!(db.stats()?, before);
        // Appending after reopen must continue the same chain.
        db.send_update(4, b"dddd", 100_001)?;
    }

    let listener = RecordingListener::new();
    let _db = EventLog::open_with_listeners(rescan_config(&path), vec![listener.clone()])?;
    assert_eq!(
        listener.updates(),
        vec![
            (10, 1, b"a".to_vec()),
            (20, 2, b"bb".to_vec()),
            (100_000, 3, b"ccc".to_vec()),
            (100_001, 4, b"dddd".to_vec()),
        ]
    );
    Ok(())
}

#[test]
fn open_replay_is_framed_and_includes_cells() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    {
        let db = EventLog::open(test_config(&path))?;
        db.send_update(1, b"event", 5)?;
        db.update_cell(1, 9, b"cell", 6)?;
    }

    let listener = RecordingListener::new();
    let _db = EventLog::open_with_listeners(rescan_config(&path), vec![listener.clone()])?;
    assert_eq!(
        listener.events(),
        vec![
            Event::StartRescan,
            Event::Update {
                offset: 0,
                timestamp: 5,
                record_type: 1,
                payload: b"event".to_vec(),
            },
            Event::Cell {
                cell_id: 1,
                offset: 0,
                timestamp: 6,
                record_type: 9,
                payload: b"cell".to_vec(),
            },
            Event::EndRescan,
        ]
    );
    Ok(())
}

#[test]
fn without_rescan_flag_listeners_only_see_new_records() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    write_records(&path, &[(1, b"old", 1)])?;

    let listener = RecordingListener::new();
    let db = EventLog::open_with_listeners(test_config(&path), vec![listener.clone()])?;
    assert!(listener.events().is_empty());
    assert_eq!(db.stats()?.listeners, 1);

    db.send_update(1, b"new", 2)?;
    assert_eq!(listener.updates(), vec![(2, 1, b"new".to_vec())]);
    Ok(())
}

#[test]
fn prior_segments_replay_first() -> Result<()> {
    let dir = tempdir()?;
    let segment = dir.path().join("segment-0.log");
    let path = dir.path().join("events.log");
    write_records(&segment, &[(1, b"s1", 1), (1, b"s2", 2)])?;
    write_records(&path, &[(2, b"main", 3)])?;

    let listener = RecordingListener::new();
    let _db = EventLog::open_with_listeners(
        rescan_config(&path).with_prior_segments(vec![segment]),
        vec![listener.clone()],
    )?;
    let payloads: Vec<Vec<u8>> = listener.updates().into_iter().map(|u| u.2).collect();
    assert_eq!(payloads, vec![b"s1".to_vec(), b"s2".to_vec(), b"main".to_vec()]);
    Ok(())
}

// --------------------- Damaged logs ---------------------

#[test]
fn truncated_body_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    write_records(&path, &[(1, b"first", 1), (1, b"second", 2)])?;

    let data = fs::read(&path)?;
    fs::write(&path, &data[..data.len() - 3])?;

    match EventLog::open(test_config(&path)) {
        Err(EventDbError::TruncatedLog {
            replayed,
            file_size,
        }) => {
            assert_eq!(replayed, 16);
            assert_eq!(file_size, 29);
        }
        other => panic!("expected truncated log, got {:?}", other),
    }
    Ok(())
}

#[test]
fn truncated_header_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    write_records(&path, &[(1, b"first", 1), (1, b"second", 2)])?;

    let data = fs::read(&path)?;
    fs::write(&path, &data[..20])?;

    assert!(matches!(
        EventLog::open(test_config(&path)),
        Err(EventDbError::TruncatedLog { replayed: 16, file_size: 20 })
    ));
    Ok(())
}

#[test]
fn corrupted_payload_is_detected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    write_records(&path, &[(1, b"payload", 1), (2, b"next", 2)])?;

    let mut data = fs::read(&path)?;
    data[9] ^= 0x01;
    fs::write(&path, &data)?;

    let err = EventLog::open(test_config(&path)).unwrap_err();
    assert!(err.is_checksum(), "unexpected error: {err}");
    match err {
        EventDbError::Rescan {
            offset,
            record_type,
            ..
        } => {
            assert_eq!(offset, 2);
            assert_eq!(record_type, Some(2));
        }
        other => panic!("expected rescan error, got {:?}", other),
    }
    Ok(())
}

#[test]
fn corrupted_record_type_is_detected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    write_records(&path, &[(1, b"payload", 1), (2, b"next", 2)])?;

    let mut data = fs::read(&path)?;
    data[2] ^= 0x40;
    fs::write(&path, &data)?;

    assert!(EventLog::open(test_config(&path)).unwrap_err().is_checksum());
    Ok(())
}

#[test]
fn corrupted_record_size_fails_open() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    write_records(&path, &[(1, b"payload", 1), (2, b"next", 2)])?;

    // One granule becomes seventeen: the body runs past end-of-file.
    let mut data = fs::read(&path)?;
    data[4] ^= 0x10;
    fs::write(&path, &data)?;

    assert!(matches!(
        EventLog::open(test_config(&path)),
        Err(EventDbError::TruncatedLog { replayed: 0, file_size: 32 })
    ));
    Ok(())
}

#[test]
fn read_only_open_requires_existing_files() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("missing.log");
    let cfg = test_config(&path).with_flags(OpenFlags::NONE.read_only());

    assert!(matches!(EventLog::open(cfg), Err(EventDbError::Io(_))));
    assert!(!path.exists());
    assert!(!test_config(&path).cells_path().exists());
    Ok(())
}

// --------------------- Explicit rescans ---------------------

#[test]
fn rescan_range_to_single_listener() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    write_records(&path, &[(1, b"a", 1), (1, b"b", 2), (1, b"c", 3)])?;
    let db = EventLog::open(test_config(&path))?;

    let all = RecordingListener::new();
    let mut state = ScanState::default();
    let end = db.rescan(0, db.write_pos()?, &mut state, false, Some(all.as_ref()))?;
    assert_eq!(end, 6);
    assert_eq!(all.updates().len(), 3);
    assert_eq!(state.cur_time, 3);
    assert_eq!(state.checksum, db.stats()?.checksum);

    // Mid-log start: adopt the checksum found at block 2.
    let tail = RecordingListener::new();
    let mut state = ScanState {
        checksum: 0,
        cur_time: 1,
    };
    db.rescan(2, 6, &mut state, true, Some(tail.as_ref()))?;
    assert_eq!(tail.updates(), vec![(2, 1, b"b".to_vec()), (3, 1, b"c".to_vec())]);

    // Without skipping, the same start fails the checksum check.
    let mut state = ScanState {
        checksum: 0,
        cur_time: 1,
    };
    let err = db
        .rescan(2, 6, &mut state, false, Some(tail.as_ref()))
        .unwrap_err();
    assert!(err.is_checksum());
    Ok(())
}

#[test]
fn rescan_without_listener_uses_registered_set() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    let db = EventLog::open(test_config(&path))?;
    db.send_update(1, b"x", 1)?;
    let listener = RecordingListener::new();
    db.add_listener_and_sync(listener.clone())?;

    let mut state = ScanState::default();
    db.rescan(0, 100, &mut state, false, None)?;
    assert_eq!(listener.updates().len(), 2);
    Ok(())
}

#[test]
fn rescan_all_replays_everything() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("events.log");
    let db = EventLog::open(test_config(&path))?;
    db.send_update(1, b"x", 1)?;
    db.update_cell(3, 1, b"c", 1)?;
    let listener = RecordingListener::new();
    db.add_listener_and_sync(listener.clone())?;
    let first = listener.events();

    db.rescan_all()?;
    let events = listener.events();
    assert_eq!(events.len(), first.len() * 2);
    assert_eq!(&events[first.len()..], &first[..]);

    assert_eq!(db.rescan_st_events()?, 1);
    assert_eq!(listener.cells().len(), 3);
    Ok(())
}
