use super::helpers::{test_config, RecordingListener};
use crate::*;
use anyhow::Result;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::io::Cursor;
use tempfile::tempdir;

// --------------------- Wire format ---------------------

#[test]
fn wire_record_layout() -> Result<()> {
    let record = ReplicationRecord {
        timestamp_delta: 5,
        record_type: 3,
        cell_id: 9,
        payload: b"xyz".to_vec(),
    };
    let mut buf = Vec::new();
    record.encode(&mut SmallRng::seed_from_u64(1), &mut buf)?;

    assert_eq!(buf.len(), WIRE_HEADER_SIZE + 8);
    assert_eq!(&buf[0..4], &5u32.to_le_bytes());
    assert_eq!(&buf[6..8], &1u16.to_le_bytes()); // one granule
    assert_eq!(&buf[8..12], &9u32.to_le_bytes());

    let mut cursor = Cursor::new(buf);
    assert_eq!(ReplicationRecord::read_from(&mut cursor)?, Some(record));
    assert_eq!(ReplicationRecord::read_from(&mut cursor)?, None);
    Ok(())
}

#[test]
fn truncated_stream_is_an_error() -> Result<()> {
    let record = ReplicationRecord {
        timestamp_delta: 1,
        record_type: 1,
        cell_id: 0,
        payload: vec![7u8; 30],
    };
    let mut buf = Vec::new();
    record.encode(&mut SmallRng::seed_from_u64(1), &mut buf)?;
    buf.truncate(buf.len() - 5);

    let err = ReplicationRecord::read_from(&mut Cursor::new(buf)).unwrap_err();
    match err {
        EventDbError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
        other => panic!("expected io error, got {:?}", other),
    }
    Ok(())
}

// --------------------- Master to slave ---------------------

#[test]
fn slave_mirrors_master() -> Result<()> {
    let dir = tempdir()?;
    let master = EventLog::open(test_config(&dir.path().join("master.log")))?;
    master.send_update(1, b"alpha", 10)?;
    master.update_cell(1, 5, b"cell-v1", 11)?;
    master.send_update(2, b"beta", 70_000)?;

    let capture = ReplicationListener::with_seed(Vec::new(), 7);
    capture.bind(&master, 0, 0)?;

    master.send_update(3, b"gamma", 70_001)?;
    master.update_cell(1, 5, b"cell-v2, longer than before", 70_002)?;
    master.update_cell(2, 6, b"second", 70_003)?;
    assert_eq!(capture.records_sent(), 6);

    let stream = capture.with_sink(|sink| sink.clone());
    let slave = EventLog::open(test_config(&dir.path().join("slave.log")).with_slave(true))?;
    let mut reader = ReplicationReader::new(Cursor::new(stream), 0, 0);
    assert_eq!(slave.apply_replication_stream(&mut reader)?, 6);
    assert_eq!(reader.records_read(), 6);

    let seen_master = RecordingListener::new();
    master.add_listener_and_sync(seen_master.clone())?;
    let seen_slave = RecordingListener::new();
    slave.add_listener_and_sync(seen_slave.clone())?;
    assert_eq!(seen_master.events(), seen_slave.events());

    let (m, s) = (master.stats()?, slave.stats()?);
    assert_eq!(m.file_size, s.file_size);
    assert_eq!(m.last_timestamp, s.last_timestamp);
    assert_eq!(m.cell_count, s.cell_count);
    assert_eq!(slave.read_cell(1)?, master.read_cell(1)?);
    Ok(())
}

#[test]
fn time_offset_rebases_timestamps() -> Result<()> {
    let dir = tempdir()?;
    let master = EventLog::open(test_config(&dir.path().join("master.log")))?;
    master.send_update(1, b"a", 100)?;
    master.send_update(1, b"b", 200)?;
    let capture = ReplicationListener::with_seed(Vec::new(), 1);
    capture.bind(&master, 0, 0)?;
    let stream = capture.with_sink(|sink| sink.clone());

    let shifted = EventLog::open(test_config(&dir.path().join("shifted.log")).with_slave(true))?;
    shifted.apply_replication_stream(&mut ReplicationReader::new(Cursor::new(stream.clone()), 0, -50))?;
    let seen = RecordingListener::new();
    shifted.add_listener_and_sync(seen.clone())?;
    let times: Vec<u32> = seen.updates().iter().map(|u| u.0).collect();
    assert_eq!(times, vec![50, 150]);

    // Negative results saturate at zero.
    let mut reader = ReplicationReader::new(Cursor::new(stream), 0, -1_000);
    let (_, t) = reader.read_record()?.expect("record");
    assert_eq!(t, 0);
    Ok(())
}

#[test]
fn bind_mid_log_uses_time_base() -> Result<()> {
    let dir = tempdir()?;
    let master = EventLog::open(test_config(&dir.path().join("master.log")))?;
    master.send_update(1, b"a", 10)?;
    master.send_update(1, b"b", 20)?;
    let third = master.send_update(1, b"c", 30)?;

    let capture = ReplicationListener::with_seed(Vec::new(), 3);
    capture.bind(&master, third, 20)?;
    assert_eq!(capture.records_sent(), 1);

    let stream = capture.with_sink(|sink| sink.clone());
    let mut reader = ReplicationReader::new(Cursor::new(stream), 20, 0);
    let (record, time) = reader.read_record()?.expect("record");
    assert_eq!(record.payload, b"c");
    assert_eq!(record.timestamp_delta, 10);
    assert_eq!(time, 30);
    assert!(reader.read_record()?.is_none());
    Ok(())
}

#[test]
fn unbind_stops_capture() -> Result<()> {
    let dir = tempdir()?;
    let master = EventLog::open(test_config(&dir.path().join("master.log")))?;
    let capture = ReplicationListener::with_seed(Vec::new(), 3);
    capture.bind(&master, 0, 0)?;
    assert!(matches!(
        capture.bind(&master, 0, 0),
        Err(EventDbError::InvalidArgument(_))
    ));

    master.send_update(1, b"captured", 1)?;
    assert!(capture.unbind(&master));
    master.send_update(1, b"missed", 2)?;

    assert_eq!(capture.records_sent(), 1);
    assert!(!capture.unbind(&master));
    Ok(())
}

#[test]
fn read_only_cannot_apply() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("slave.log");
    drop(EventLog::open(test_config(&path))?);

    let slave = EventLog::open(test_config(&path).with_flags(OpenFlags::NONE.read_only()))?;
    let mut reader = ReplicationReader::new(Cursor::new(Vec::new()), 0, 0);
    assert!(matches!(
        slave.read_replication_data(&mut reader),
        Err(EventDbError::ReadOnly)
    ));
    Ok(())
}
