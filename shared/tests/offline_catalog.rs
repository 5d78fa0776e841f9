mod common;

use std::sync::Arc;

use proptest::prelude::*;

use offline_maps_core::capabilities::KeyValueStore;
use offline_maps_core::model::{LatLon, MapSnapshot, SnapshotId, Zoom};
use offline_maps_core::offline_store::FileKvStore;
use offline_maps_core::Event;

use common::{memory_store, persisted, Shell};

fn download(shell: &mut Shell, center: LatLon, zoom: Zoom) -> MapSnapshot {
    shell.send(Event::DownloadRequested {
        center: Some(center),
        zoom: Some(zoom),
        name: None,
    });
    assert!(!shell.model.catalog.is_downloading());
    shell.model.catalog.snapshots().last().cloned().unwrap()
}

#[derive(Debug, Clone)]
enum Op {
    Download { lat_q: i32, lng_q: i32, zoom: i64 },
    Delete { pick: usize },
    DeleteMissing,
    Select { pick: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        // Quarter-degree grid keeps coordinates exact through JSON.
        (-360i32..=360, -720i32..=720, 1i64..=20)
            .prop_map(|(lat_q, lng_q, zoom)| Op::Download { lat_q, lng_q, zoom }),
        (0usize..8).prop_map(|pick| Op::Delete { pick }),
        Just(Op::DeleteMissing),
        (0usize..8).prop_map(|pick| Op::Select { pick }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_persisted_catalog_matches_memory(ops in prop::collection::vec(op_strategy(), 1..25)) {
        let store = memory_store();
        let mut shell = Shell::start(store.clone(), true);

        for op in ops {
            match op {
                Op::Download { lat_q, lng_q, zoom } => {
                    let center = LatLon::new(f64::from(lat_q) / 4.0, f64::from(lng_q) / 4.0).unwrap();
                    let before = shell.model.catalog.len();
                    download(&mut shell, center, Zoom::new(zoom).unwrap());
                    prop_assert_eq!(shell.model.catalog.len(), before + 1);
                }
                Op::Delete { pick } => {
                    if let Some(id) = shell.model.catalog.snapshots().get(pick).map(|s| s.id) {
                        shell.send(Event::SnapshotDeleted { id });
                        prop_assert!(shell.model.catalog.get(id).is_none());
                    }
                }
                Op::DeleteMissing => {
                    let before = shell.model.catalog.snapshots().to_vec();
                    let selected = shell.model.catalog.selected_id();
                    shell.send(Event::SnapshotDeleted { id: SnapshotId(u64::MAX) });
                    prop_assert_eq!(shell.model.catalog.snapshots(), before.as_slice());
                    prop_assert_eq!(shell.model.catalog.selected_id(), selected);
                }
                Op::Select { pick } => {
                    if let Some(id) = shell.model.catalog.snapshots().get(pick).map(|s| s.id) {
                        shell.send(Event::SnapshotSelected { id });
                        prop_assert_eq!(shell.model.catalog.selected_id(), Some(id));
                    }
                }
            }

            prop_assert_eq!(persisted(&store), shell.model.catalog.snapshots().to_vec());
            if let Some(id) = shell.model.catalog.selected_id() {
                prop_assert!(shell.model.catalog.get(id).is_some());
            }
        }

        let expected_mb: f64 = shell
            .model
            .catalog
            .snapshots()
            .iter()
            .map(MapSnapshot::size_megabytes)
            .sum();
        prop_assert!((shell.model.catalog.total_storage_used() - expected_mb).abs() < 1e-9);
    }
}

#[test]
fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline-maps.json");

    let committed = {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileKvStore::open(&path));
        let mut shell = Shell::start(store, true);
        let a = download(&mut shell, LatLon::new(22.5, 88.25).unwrap(), Zoom::new(12).unwrap());
        let b = download(&mut shell, LatLon::new(-33.75, 151.25).unwrap(), Zoom::new(15).unwrap());
        shell.send(Event::SnapshotDeleted { id: a.id });
        vec![b]
    };

    let reopened: Arc<dyn KeyValueStore> = Arc::new(FileKvStore::open(&path));
    let restored = Shell::start(reopened, false);

    assert_eq!(restored.model.catalog.snapshots(), committed.as_slice());
    assert_eq!(restored.model.catalog.selected_id(), None);
}

#[test]
fn test_truncated_file_loads_as_empty_catalog() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline-maps.json");
    {
        let store: Arc<dyn KeyValueStore> = Arc::new(FileKvStore::open(&path));
        let mut shell = Shell::start(store, true);
        download(&mut shell, LatLon::new(1.0, 1.0).unwrap(), Zoom::new(3).unwrap());
    }

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let store: Arc<dyn KeyValueStore> = Arc::new(FileKvStore::open(&path));
    let shell = Shell::start(store, true);
    assert!(shell.model.catalog.is_empty());
    assert!(shell.view().toast.is_none());
}

#[cfg(not(target_arch = "wasm32"))]
#[test]
fn test_sqlite_store_survives_restart() {
    use offline_maps_core::offline_store::SqliteKvStore;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline-maps.db");

    let committed = {
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteKvStore::open(&path).unwrap());
        let mut shell = Shell::start(store, true);
        download(&mut shell, LatLon::new(35.5, 139.75).unwrap(), Zoom::new(11).unwrap())
    };

    let reopened: Arc<dyn KeyValueStore> = Arc::new(SqliteKvStore::open(&path).unwrap());
    let restored = Shell::start(reopened, true);

    assert_eq!(restored.model.catalog.snapshots(), std::slice::from_ref(&committed));
}
