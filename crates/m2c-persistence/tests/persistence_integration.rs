//! ---
//! m2c_section: "03-persistence-logging"
//! m2c_subsection: "tests"
//! m2c_type: "test"
//! m2c_scope: "code"
//! m2c_description: "Stream, checkpoint and metrics integration tests."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::sync::Arc;

use m2c_persistence::{
    CheckpointKind, CheckpointStore, LocalRecordStream, PersistenceError, PersistenceMetrics,
    StreamOptions, StreamStore, CHECKPOINT_FILE_NAME,
};
use prometheus::Registry;
use tempfile::tempdir;

#[test]
fn stream_and_checkpoints_survive_restart() {
    let dir = tempdir().unwrap();
    let streams = dir.path().join("streams");
    let checkpoints = dir.path().join("m2c2-conn-publisher").join(CHECKPOINT_FILE_NAME);

    {
        let stream =
            LocalRecordStream::open(&streams, "m2c2_conn_stream", StreamOptions::default(), None)
                .unwrap();
        for i in 0..5u8 {
            stream.append(&[i]).unwrap();
        }
        stream.flush().unwrap();
        let store = CheckpointStore::open(&checkpoints, None).unwrap();
        store
            .commit(
                "m2c2_conn_stream",
                &[(CheckpointKind::Trailing, 2), (CheckpointKind::Primary, 3)],
            )
            .unwrap();
    }

    let stream =
        LocalRecordStream::open(&streams, "m2c2_conn_stream", StreamOptions::default(), None)
            .unwrap();
    let store = CheckpointStore::open(&checkpoints, None).unwrap();
    let resume = store
        .get("m2c2_conn_stream", CheckpointKind::Trailing)
        .map(|trailing| trailing + 1)
        .unwrap();
    assert_eq!(resume, 3);
    assert_eq!(stream.read(resume).unwrap(), vec![3]);
    assert_eq!(stream.newest_sequence(), Some(4));
}

#[test]
fn metrics_track_appends_and_evictions() {
    let dir = tempdir().unwrap();
    let registry = Arc::new(Registry::new());
    let metrics = PersistenceMetrics::new(Arc::clone(&registry)).unwrap();
    let store = StreamStore::new(dir.path(), StreamOptions::new(48, 24), Some(metrics));
    let stream = store.open_stream("bounded").unwrap();
    for i in 0..6u64 {
        stream.append(&i.to_be_bytes()[..4]).unwrap();
    }
    let families = registry.gather();
    let appended = families
        .iter()
        .find(|family| family.get_name() == "m2c_stream_bytes_appended_total")
        .unwrap();
    assert_eq!(appended.get_metric()[0].get_counter().get_value(), 96.0);
    let evicted = families
        .iter()
        .find(|family| family.get_name() == "m2c_stream_evicted_total")
        .unwrap();
    assert!(evicted.get_metric()[0].get_counter().get_value() >= 2.0);
    assert!(matches!(
        stream.read(0),
        Err(PersistenceError::Evicted { .. })
    ));
}
