use groundtruth::core::cache::MemoryCacheStore;
use groundtruth::core::config::Config;
use groundtruth::core::diff::{self, ENTITY_COUNT_DELTA, SIZE_DELTA};
use groundtruth::core::error::DiscoveryError;
use groundtruth::core::ladder::DiscoveryLadder;
use groundtruth::core::model::{Facts, FailureKind, LadderResult, ProbeOutcome, Target, TargetKind};
use groundtruth::core::probe::{Probe, ProbeError};
use groundtruth::core::snapshot::{EntityRecord, Snapshot, SnapshotManager};
use groundtruth::core::store::Store;
use groundtruth::core::trace;
use serde_json::{Value, json};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use tempfile::{TempDir, tempdir};

/// Probe over an in-memory "world" of name -> (content, size). Level 1 reports
/// the whole world as facts; entities are read back from those facts.
struct WorldProbe {
    kind: TargetKind,
    world: RefCell<BTreeMap<String, (String, u64)>>,
    offline: Cell<bool>,
}

impl WorldProbe {
    fn new(kind: TargetKind, items: &[(&str, &str, u64)]) -> Self {
        let probe = Self {
            kind,
            world: RefCell::new(BTreeMap::new()),
            offline: Cell::new(false),
        };
        for (name, content, size) in items {
            probe.set(name, content, *size);
        }
        probe
    }

    fn set(&self, name: &str, content: &str, size: u64) {
        self.world
            .borrow_mut()
            .insert(name.to_string(), (content.to_string(), size));
    }

    fn remove(&self, name: &str) {
        self.world.borrow_mut().remove(name);
    }
}

impl Probe for WorldProbe {
    fn kind(&self) -> TargetKind {
        self.kind
    }

    fn max_level(&self) -> u8 {
        2
    }

    fn level_name(&self, _level: u8) -> &'static str {
        "world"
    }

    fn invoke(
        &self,
        _target: &Target,
        level: u8,
        _so_far: &LadderResult,
    ) -> Result<ProbeOutcome, ProbeError> {
        if self.offline.get() {
            return Ok(ProbeOutcome::failure(FailureKind::Connectivity, "world unreachable"));
        }
        let mut facts = Facts::new();
        if level == 1 {
            let items: serde_json::Map<String, Value> = self
                .world
                .borrow()
                .iter()
                .map(|(k, (content, size))| (k.clone(), json!({ "content": content, "size": size })))
                .collect();
            facts.insert("items".into(), Value::Object(items));
        }
        Ok(ProbeOutcome::success(facts))
    }

    fn entities(&self, result: &LadderResult) -> BTreeMap<String, EntityRecord> {
        let Some(items) = result
            .facts(1)
            .and_then(|f| f.get("items"))
            .and_then(Value::as_object)
        else {
            return BTreeMap::new();
        };
        items
            .iter()
            .map(|(name, item)| {
                let size = item.get("size").and_then(Value::as_u64).unwrap_or(0);
                let content = item.get("content").cloned().unwrap_or(Value::Null);
                let mut record = EntityRecord::from_fields(&content);
                record.size = size;
                (name.clone(), record)
            })
            .collect()
    }
}

fn setup() -> (TempDir, Store) {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path().join("state"));
    store.ensure().expect("ensure");
    (tmp, store)
}

fn capture(store: &Store, probe: &WorldProbe, target: &Target) -> Snapshot {
    let config = Config::default();
    let mut cache = MemoryCacheStore::new();
    let mut ladder = DiscoveryLadder::new(probe, &mut cache, &config);
    SnapshotManager::new(store)
        .capture(&mut ladder, target, 2)
        .expect("capture")
}

fn target() -> Target {
    Target::filesystem("/srv/site")
}

#[test]
fn capture_persists_and_round_trips() {
    let (_tmp, store) = setup();
    let probe = WorldProbe::new(
        TargetKind::Filesystem,
        &[("f1", "hello", 5), ("f2", "world!", 6)],
    );
    let snap = capture(&store, &probe, &target());

    assert_eq!(snap.discovery_level, 2);
    assert_eq!(snap.statistics.entity_count, 2);
    assert_eq!(snap.statistics.total_size, 11);
    assert!((snap.statistics.overall_confidence - 0.95).abs() < 1e-9);
    assert_eq!(snap.state.level_confidence.len(), 2);

    let file = store
        .snapshots_dir()
        .join(format!("snapshot_{}.json", snap.snapshot_id));
    assert!(file.is_file());

    let manager = SnapshotManager::new(&store);
    assert_eq!(manager.load(&snap.snapshot_id).expect("load"), snap);
    assert_eq!(
        manager.latest(&target()).expect("latest").expect("some"),
        snap
    );

    let latest: BTreeMap<String, String> = serde_json::from_str(
        &std::fs::read_to_string(store.snapshots_dir().join("latest.json")).expect("latest.json"),
    )
    .expect("parse latest.json");
    assert_eq!(latest.get("fs:/srv/site"), Some(&snap.snapshot_id));
}

#[test]
fn compare_with_latest_reports_added_removed_modified() {
    let (_tmp, store) = setup();
    let manager = SnapshotManager::new(&store);
    let config = Config::default();
    let probe = WorldProbe::new(
        TargetKind::Filesystem,
        &[("f1", "v1", 10), ("f2", "same", 20)],
    );

    let (first, changes) = {
        let mut cache = MemoryCacheStore::new();
        let mut ladder = DiscoveryLadder::new(&probe, &mut cache, &config);
        manager
            .compare_with_latest(&mut ladder, &target(), 2)
            .expect("first")
    };
    assert!(changes.is_none(), "first capture has nothing to compare");

    probe.set("f1", "v2", 15);
    probe.remove("f2");
    probe.set("f3", "new", 7);

    let (second, changes) = {
        let mut cache = MemoryCacheStore::new();
        let mut ladder = DiscoveryLadder::new(&probe, &mut cache, &config);
        manager
            .compare_with_latest(&mut ladder, &target(), 2)
            .expect("second")
    };
    let changes = changes.expect("changes against first");

    assert_eq!(changes.base, first.snapshot_id);
    assert_eq!(changes.target, second.snapshot_id);
    assert_eq!(changes.added.iter().collect::<Vec<_>>(), vec!["f3"]);
    assert_eq!(changes.removed.iter().collect::<Vec<_>>(), vec!["f2"]);
    assert_eq!(changes.modified.iter().collect::<Vec<_>>(), vec!["f1"]);
    assert_eq!(changes.aggregate_deltas[SIZE_DELTA], 22 - 30);
    assert_eq!(changes.aggregate_deltas[ENTITY_COUNT_DELTA], 0);
    assert_eq!(
        manager.latest(&target()).expect("latest").expect("some").snapshot_id,
        second.snapshot_id
    );
}

#[test]
fn halted_capture_is_not_diffed_and_keeps_latest() {
    let (_tmp, store) = setup();
    let manager = SnapshotManager::new(&store);
    let config = Config::default();
    let probe = WorldProbe::new(TargetKind::Filesystem, &[("f1", "v1", 10), ("f2", "v2", 8)]);
    let complete = capture(&store, &probe, &target());
    assert!(!complete.is_partial());

    probe.offline.set(true);
    let (halted, changes) = {
        let mut cache = MemoryCacheStore::new();
        let mut ladder = DiscoveryLadder::new(&probe, &mut cache, &config);
        manager
            .compare_with_latest(&mut ladder, &target(), 2)
            .expect("halted capture")
    };

    assert!(changes.is_none(), "nothing was observed, so nothing was removed");
    assert!(halted.is_partial());
    assert_eq!(halted.discovery_level, 0);
    assert_eq!(halted.requested_level, 2);
    assert_eq!(halted.halted.as_ref().map(|h| h.level), Some(1));
    assert_eq!(halted.statistics.entity_count, 0);
    assert_eq!(
        manager.latest(&target()).unwrap().unwrap().snapshot_id,
        complete.snapshot_id
    );
    // The record itself is still kept.
    assert!(manager.load(&halted.snapshot_id).is_ok());
    let rows = manager.list(Some(&target())).unwrap();
    assert_eq!(rows.iter().filter(|r| r.partial).count(), 1);

    probe.offline.set(false);
    probe.remove("f2");
    let (recovered, changes) = {
        let mut cache = MemoryCacheStore::new();
        let mut ladder = DiscoveryLadder::new(&probe, &mut cache, &config);
        manager
            .compare_with_latest(&mut ladder, &target(), 2)
            .expect("recovered capture")
    };
    let changes = changes.expect("diff against the last complete capture");
    assert_eq!(changes.base, complete.snapshot_id);
    assert_eq!(changes.removed.iter().collect::<Vec<_>>(), vec!["f2"]);
    assert_eq!(
        manager.latest(&target()).unwrap().unwrap().snapshot_id,
        recovered.snapshot_id
    );

    let events = trace::last_events(&store, 50).expect("events");
    assert!(events.iter().any(|e| e.op == "snapshot.compare" && e.status == "skipped"));
}

#[test]
fn first_capture_may_be_partial() {
    let (_tmp, store) = setup();
    let probe = WorldProbe::new(TargetKind::Filesystem, &[("a", "x", 1)]);
    probe.offline.set(true);
    let snap = capture(&store, &probe, &target());
    assert!(snap.is_partial());
    assert_eq!(
        SnapshotManager::new(&store)
            .latest(&target())
            .unwrap()
            .unwrap()
            .snapshot_id,
        snap.snapshot_id
    );
}

#[test]
fn unchanged_world_diffs_empty() {
    let (_tmp, store) = setup();
    let probe = WorldProbe::new(TargetKind::Filesystem, &[("a", "x", 1), ("b", "y", 2)]);
    let a = capture(&store, &probe, &target());
    let b = capture(&store, &probe, &target());

    assert_ne!(a.snapshot_id, b.snapshot_id);
    let changes = diff::diff(&a, &b).expect("diff");
    assert!(changes.is_empty());
    assert!(changes.aggregate_deltas.values().all(|d| *d == 0));
    assert!(diff::diff(&a, &a).expect("self diff").is_empty());
}

#[test]
fn diff_is_antisymmetric() {
    let (_tmp, store) = setup();
    let probe = WorldProbe::new(TargetKind::Filesystem, &[("a", "x", 1), ("b", "y", 2)]);
    let before = capture(&store, &probe, &target());
    probe.remove("a");
    probe.set("b", "changed", 4);
    probe.set("c", "z", 8);
    let after = capture(&store, &probe, &target());

    let forward = diff::diff(&before, &after).expect("forward");
    let backward = diff::diff(&after, &before).expect("backward");
    assert_eq!(forward.added, backward.removed);
    assert_eq!(forward.removed, backward.added);
    assert_eq!(forward.modified, backward.modified);
    for (key, delta) in &forward.aggregate_deltas {
        assert_eq!(backward.aggregate_deltas[key], -delta);
    }
}

#[test]
fn diff_across_targets_is_rejected() {
    let (_tmp, store) = setup();
    let probe = WorldProbe::new(TargetKind::Filesystem, &[("a", "x", 1)]);
    let one = capture(&store, &probe, &Target::filesystem("/one"));
    let two = capture(&store, &probe, &Target::filesystem("/two"));

    match diff::diff(&one, &two) {
        Err(DiscoveryError::TargetMismatch { base, target }) => {
            assert_eq!(base, "fs:/one");
            assert_eq!(target, "fs:/two");
        }
        other => panic!("expected target mismatch, got {:?}", other),
    }
}

#[test]
fn snapshots_are_write_once() {
    let (_tmp, store) = setup();
    let probe = WorldProbe::new(TargetKind::Filesystem, &[("a", "x", 1)]);
    let snap = capture(&store, &probe, &target());

    let err = SnapshotManager::new(&store)
        .save(&snap)
        .expect_err("second save of the same id");
    assert!(matches!(err, DiscoveryError::ValidationError(_)));
}

#[test]
fn list_filters_by_target_and_orders_oldest_first() {
    let (_tmp, store) = setup();
    let fs_probe = WorldProbe::new(TargetKind::Filesystem, &[("a", "x", 1)]);
    let db_probe = WorldProbe::new(TargetKind::Database, &[("table/users", "cols", 0)]);
    let db = Target::new(TargetKind::Database, "https://db.example.test");

    let a = capture(&store, &fs_probe, &target());
    let b = capture(&store, &fs_probe, &target());
    let c = capture(&store, &db_probe, &db);

    let manager = SnapshotManager::new(&store);
    let all = manager.list(None).expect("list all");
    assert_eq!(all.len(), 3);
    let times: Vec<u64> = all
        .iter()
        .map(|s| s.timestamp.trim_end_matches('Z').parse().unwrap())
        .collect();
    assert!(times.windows(2).all(|w| w[0] <= w[1]));

    let mut fs_ids: Vec<String> = manager
        .list(Some(&target()))
        .expect("list fs")
        .into_iter()
        .map(|s| s.snapshot_id)
        .collect();
    fs_ids.sort();
    let mut expected = vec![a.snapshot_id, b.snapshot_id];
    expected.sort();
    assert_eq!(fs_ids, expected);

    let db_rows = manager.list(Some(&db)).expect("list db");
    assert_eq!(db_rows.len(), 1);
    assert_eq!(db_rows[0].snapshot_id, c.snapshot_id);
    assert_eq!(db_rows[0].entity_count, 1);
}

#[test]
fn prune_moves_latest_pointer_back() {
    let (_tmp, store) = setup();
    let probe = WorldProbe::new(TargetKind::Filesystem, &[("a", "x", 1)]);
    let manager = SnapshotManager::new(&store);
    let older = capture(&store, &probe, &target());
    let newer = capture(&store, &probe, &target());
    assert_eq!(
        manager.latest(&target()).unwrap().unwrap().snapshot_id,
        newer.snapshot_id
    );

    let pruned = manager.prune(&newer.snapshot_id).expect("prune newer");
    assert_eq!(pruned.snapshot_id, newer.snapshot_id);
    assert!(matches!(
        manager.load(&newer.snapshot_id),
        Err(DiscoveryError::NotFound(_))
    ));
    assert_eq!(
        manager.latest(&target()).unwrap().unwrap().snapshot_id,
        older.snapshot_id
    );

    manager.prune(&older.snapshot_id).expect("prune older");
    assert!(manager.latest(&target()).unwrap().is_none());
    assert!(manager.list(Some(&target())).unwrap().is_empty());
}

#[test]
fn pruning_a_non_latest_snapshot_keeps_pointer() {
    let (_tmp, store) = setup();
    let probe = WorldProbe::new(TargetKind::Filesystem, &[("a", "x", 1)]);
    let manager = SnapshotManager::new(&store);
    let older = capture(&store, &probe, &target());
    let newer = capture(&store, &probe, &target());

    manager.prune(&older.snapshot_id).expect("prune older");
    assert_eq!(
        manager.latest(&target()).unwrap().unwrap().snapshot_id,
        newer.snapshot_id
    );
}

#[test]
fn malformed_and_missing_ids_are_reported() {
    let (_tmp, store) = setup();
    let manager = SnapshotManager::new(&store);
    assert!(matches!(
        manager.load("../latest"),
        Err(DiscoveryError::ValidationError(_))
    ));
    assert!(matches!(
        manager.load("0123456789abcdef"),
        Err(DiscoveryError::NotFound(_))
    ));
    assert!(matches!(
        manager.prune("0123456789abcdef"),
        Err(DiscoveryError::NotFound(_))
    ));
    assert!(manager.latest(&target()).unwrap().is_none());
}

#[test]
fn captures_and_prunes_are_audited() {
    let (_tmp, store) = setup();
    let probe = WorldProbe::new(TargetKind::Filesystem, &[("a", "x", 1)]);
    let snap = capture(&store, &probe, &target());
    SnapshotManager::new(&store)
        .prune(&snap.snapshot_id)
        .expect("prune");

    let events = trace::last_events(&store, 10).expect("events");
    let ops: Vec<&str> = events.iter().map(|e| e.op.as_str()).collect();
    assert_eq!(ops, vec!["snapshot.capture", "snapshot.prune"]);
    assert_eq!(events[0].detail["snapshot_id"], json!(snap.snapshot_id));
    assert_eq!(events[0].target, "fs:/srv/site");
}
