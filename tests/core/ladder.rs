use groundtruth::core::cache::{CacheStore, FileCacheStore, MemoryCacheStore};
use groundtruth::core::config::Config;
use groundtruth::core::ladder::DiscoveryLadder;
use groundtruth::core::model::{
    DiscoveryKey, Facts, FailureKind, LadderResult, ProbeOutcome, Target, TargetKind,
};
use groundtruth::core::probe::{Probe, ProbeError};
use groundtruth::core::snapshot::EntityRecord;
use groundtruth::core::store::Store;
use groundtruth::core::trace;
use serde_json::json;
use std::cell::RefCell;
use std::collections::BTreeMap;
use tempfile::tempdir;

/// Probe whose per-level answers are scripted up front. Unscripted levels
/// succeed cleanly with a single `level` fact.
struct ScriptedProbe {
    script: BTreeMap<u8, Result<ProbeOutcome, ProbeError>>,
    calls: RefCell<Vec<u8>>,
}

impl ScriptedProbe {
    fn clean() -> Self {
        Self::with(vec![])
    }

    fn with(script: Vec<(u8, Result<ProbeOutcome, ProbeError>)>) -> Self {
        Self {
            script: script.into_iter().collect(),
            calls: RefCell::new(Vec::new()),
        }
    }

    fn take_calls(&self) -> Vec<u8> {
        std::mem::take(&mut *self.calls.borrow_mut())
    }
}

impl Probe for ScriptedProbe {
    fn kind(&self) -> TargetKind {
        TargetKind::Filesystem
    }

    fn max_level(&self) -> u8 {
        5
    }

    fn level_name(&self, level: u8) -> &'static str {
        match level {
            1 => "reach",
            2 => "list",
            3 => "inspect",
            _ => "deep",
        }
    }

    fn invoke(
        &self,
        _target: &Target,
        level: u8,
        _so_far: &LadderResult,
    ) -> Result<ProbeOutcome, ProbeError> {
        self.calls.borrow_mut().push(level);
        self.script.get(&level).cloned().unwrap_or_else(|| {
            let mut facts = Facts::new();
            facts.insert("level".into(), json!(level));
            Ok(ProbeOutcome::success(facts))
        })
    }

    fn entities(&self, _result: &LadderResult) -> BTreeMap<String, EntityRecord> {
        BTreeMap::new()
    }
}

fn target() -> Target {
    Target::filesystem("/srv/data")
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn three_clean_levels_score_their_calibrated_maximum() {
    let probe = ScriptedProbe::clean();
    let mut cache = MemoryCacheStore::new();
    let config = Config::default();

    let result = DiscoveryLadder::new(&probe, &mut cache, &config)
        .discover_at(&target(), 3, 1_000)
        .expect("discover");

    assert_eq!(result.levels.len(), 3);
    assert!(approx(result.level(1).unwrap().confidence, 1.0));
    assert!(approx(result.level(2).unwrap().confidence, 0.9));
    assert!(approx(result.level(3).unwrap().confidence, 0.8));
    assert!(approx(result.overall_confidence, 0.9));
    assert!(result.levels.values().all(|l| !l.from_cache));
    assert_eq!(result.max_level_requested, 3);
    assert!(result.halted.is_none());
    assert_eq!(probe.take_calls(), vec![1, 2, 3]);
}

#[test]
fn permission_denied_omits_level_and_stops() {
    let probe = ScriptedProbe::with(vec![(
        2,
        Ok(ProbeOutcome::failure(
            FailureKind::Permission,
            "token lacks scope",
        )),
    )]);
    let mut cache = MemoryCacheStore::new();
    let config = Config::default();

    let result = DiscoveryLadder::new(&probe, &mut cache, &config)
        .discover_at(&target(), 3, 1_000)
        .expect("discover");

    assert_eq!(result.levels.keys().copied().collect::<Vec<_>>(), vec![1]);
    assert!(approx(result.overall_confidence, 1.0));
    let halt = result.halted.expect("halted");
    assert_eq!(halt.level, 2);
    assert!(halt.reason.contains("permission_denied"));
    assert_eq!(probe.take_calls(), vec![1, 2]);
}

#[test]
fn permission_error_from_transport_is_treated_like_denial() {
    let probe = ScriptedProbe::with(vec![(3, Err(ProbeError::Permission("401".into())))]);
    let mut cache = MemoryCacheStore::new();
    let config = Config::default();

    let result = DiscoveryLadder::new(&probe, &mut cache, &config)
        .discover_at(&target(), 5, 1_000)
        .expect("discover");

    assert_eq!(result.deepest_level(), 2);
    assert!(result.level(3).is_none());
    assert!(approx(result.overall_confidence, 0.95));
}

#[test]
fn second_run_within_ttl_is_served_from_cache() {
    let probe = ScriptedProbe::clean();
    let mut cache = MemoryCacheStore::new();
    let config = Config::default();
    let mut ladder = DiscoveryLadder::new(&probe, &mut cache, &config);

    let first = ladder.discover_at(&target(), 3, 1_000).expect("first");
    assert_eq!(probe.take_calls(), vec![1, 2, 3]);

    let second = ladder.discover_at(&target(), 3, 1_030).expect("second");
    assert!(probe.take_calls().is_empty());
    assert!(second.levels.values().all(|l| l.from_cache));
    for level in 1..=3 {
        assert_eq!(
            first.level(level).unwrap().facts,
            second.level(level).unwrap().facts
        );
        assert!(approx(
            first.level(level).unwrap().confidence,
            second.level(level).unwrap().confidence
        ));
    }
    assert!(approx(first.overall_confidence, second.overall_confidence));
}

#[test]
fn expired_levels_are_probed_again() {
    let probe = ScriptedProbe::clean();
    let mut cache = MemoryCacheStore::new();
    let config = Config::default();
    let mut ladder = DiscoveryLadder::new(&probe, &mut cache, &config);

    ladder.discover_at(&target(), 3, 1_000).expect("first");
    probe.take_calls();

    // Levels 1 and 2 live 60s, level 3 lives 300s.
    let later = ladder.discover_at(&target(), 3, 1_061).expect("later");
    assert_eq!(probe.take_calls(), vec![1, 2]);
    assert!(!later.level(1).unwrap().from_cache);
    assert!(!later.level(2).unwrap().from_cache);
    assert!(later.level(3).unwrap().from_cache);

    ladder.discover_at(&target(), 3, 1_400).expect("much later");
    assert_eq!(probe.take_calls(), vec![1, 2, 3]);
}

#[test]
fn failed_levels_are_never_cached() {
    let probe = ScriptedProbe::with(vec![(
        2,
        Ok(ProbeOutcome::failure(
            FailureKind::Connectivity,
            "connection refused",
        )),
    )]);
    let mut cache = MemoryCacheStore::new();
    let config = Config::default();

    {
        let mut ladder = DiscoveryLadder::new(&probe, &mut cache, &config);
        let result = ladder.discover_at(&target(), 3, 1_000).expect("first");
        let failed = result.level(2).expect("level 2 recorded");
        assert_eq!(failed.confidence, 0.0);
        assert_eq!(failed.failure, Some(FailureKind::Connectivity));
        assert_eq!(failed.warnings, vec!["connectivity: connection refused"]);
        assert!(result.level(3).is_none());
        assert!(approx(result.overall_confidence, 0.5));

        ladder.discover_at(&target(), 3, 1_010).expect("second");
    }

    assert_eq!(probe.take_calls(), vec![1, 2, 2]);
    assert!(cache.get(&DiscoveryKey::new(&target(), 1), 1_010).is_some());
    assert!(cache.get(&DiscoveryKey::new(&target(), 2), 1_010).is_none());
}

#[test]
fn warnings_reduce_confidence_by_band() {
    let three: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    let six: Vec<String> = (0..6).map(|i| format!("w{}", i)).collect();
    let probe = ScriptedProbe::with(vec![
        (3, Ok(ProbeOutcome::with_warnings(Facts::new(), three))),
        (4, Ok(ProbeOutcome::with_warnings(Facts::new(), six))),
    ]);
    let mut cache = MemoryCacheStore::new();
    let config = Config::default();

    let result = DiscoveryLadder::new(&probe, &mut cache, &config)
        .discover_at(&target(), 4, 1_000)
        .expect("discover");

    assert!(approx(result.level(3).unwrap().confidence, 0.56));
    assert!(approx(result.level(4).unwrap().confidence, 0.35));
    assert!(approx(
        result.overall_confidence,
        (1.0 + 0.9 + 0.56 + 0.35) / 4.0
    ));
}

#[test]
fn result_is_always_a_contiguous_prefix() {
    let scripts: Vec<Vec<(u8, Result<ProbeOutcome, ProbeError>)>> = vec![
        vec![],
        vec![(1, Err(ProbeError::Timeout(5)))],
        vec![(2, Err(ProbeError::Malformed("not json".into())))],
        vec![(3, Err(ProbeError::Permission("no".into())))],
        vec![(4, Err(ProbeError::Connectivity("down".into())))],
    ];
    for script in scripts {
        let probe = ScriptedProbe::with(script);
        let mut cache = MemoryCacheStore::new();
        let config = Config::default();
        let result = DiscoveryLadder::new(&probe, &mut cache, &config)
            .discover_at(&target(), 5, 1_000)
            .expect("discover");

        let k = result.deepest_level();
        let keys: Vec<u8> = result.levels.keys().copied().collect();
        assert_eq!(keys, (1..=k).collect::<Vec<_>>());
        for level in result.levels.values() {
            assert!((0.0..=1.0).contains(&level.confidence));
            assert!(level.failure.is_none() || level.confidence == 0.0);
        }
        assert!((0.0..=1.0).contains(&result.overall_confidence));
    }
}

#[test]
fn level_one_failure_yields_zero_overall_confidence() {
    let probe = ScriptedProbe::with(vec![(1, Err(ProbeError::Timeout(5)))]);
    let mut cache = MemoryCacheStore::new();
    let config = Config::default();

    let result = DiscoveryLadder::new(&probe, &mut cache, &config)
        .discover_at(&target(), 3, 1_000)
        .expect("discover");

    assert_eq!(result.levels.len(), 1);
    assert_eq!(result.overall_confidence, 0.0);
    assert_eq!(result.halted.unwrap().level, 1);
    assert!(cache.is_empty());
}

#[test]
fn file_cache_survives_a_restart() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path().join("state"));
    store.ensure().expect("ensure");
    let config = Config::default();
    let probe = ScriptedProbe::clean();

    {
        let mut cache = FileCacheStore::new(&store, "default");
        DiscoveryLadder::new(&probe, &mut cache, &config)
            .discover_at(&target(), 3, 1_000)
            .expect("first process");
    }
    assert_eq!(probe.take_calls(), vec![1, 2, 3]);

    let mut reopened = FileCacheStore::new(&store, "default");
    let key = DiscoveryKey::new(&target(), 2);
    let entry = reopened.read_entry(&key).expect("entry on disk");
    assert_eq!(entry.ttl_secs, 60);
    assert_eq!(entry.cached_at, 1_000);

    let result = DiscoveryLadder::new(&probe, &mut reopened, &config)
        .discover_at(&target(), 3, 1_020)
        .expect("second process");
    assert!(probe.take_calls().is_empty());
    assert!(result.levels.values().all(|l| l.from_cache));
    assert_eq!(
        result.level(2).unwrap().facts.get("level"),
        Some(&json!(2))
    );
}

#[test]
fn cache_scopes_do_not_share_entries() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    let config = Config::default();
    let probe = ScriptedProbe::clean();

    let mut first = FileCacheStore::new(&store, "alpha");
    DiscoveryLadder::new(&probe, &mut first, &config)
        .discover_at(&target(), 2, 1_000)
        .expect("alpha");
    probe.take_calls();

    let mut second = FileCacheStore::new(&store, "beta");
    DiscoveryLadder::new(&probe, &mut second, &config)
        .discover_at(&target(), 2, 1_010)
        .expect("beta");
    assert_eq!(probe.take_calls(), vec![1, 2]);
}

#[test]
fn invalidate_all_forces_fresh_probes() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    let config = Config::default();
    let probe = ScriptedProbe::clean();
    let mut cache = FileCacheStore::new(&store, "default");

    DiscoveryLadder::new(&probe, &mut cache, &config)
        .discover_at(&target(), 3, 1_000)
        .expect("first");
    probe.take_calls();

    assert_eq!(cache.invalidate_all(&target()).expect("invalidate"), 3);
    let result = DiscoveryLadder::new(&probe, &mut cache, &config)
        .discover_at(&target(), 3, 1_001)
        .expect("second");
    assert_eq!(probe.take_calls(), vec![1, 2, 3]);
    assert!(result.levels.values().all(|l| !l.from_cache));
}

#[test]
fn audited_ladder_writes_level_events() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    store.ensure().expect("ensure");
    let config = Config::default();
    let probe = ScriptedProbe::with(vec![(2, Err(ProbeError::Timeout(5)))]);
    let mut cache = MemoryCacheStore::new();

    DiscoveryLadder::new(&probe, &mut cache, &config)
        .with_audit(&store)
        .discover_at(&target(), 3, 1_000)
        .expect("discover");

    let events = trace::last_events(&store, 10).expect("events");
    let ops: Vec<(&str, &str)> = events
        .iter()
        .map(|e| (e.op.as_str(), e.status.as_str()))
        .collect();
    assert_eq!(
        ops,
        vec![
            ("ladder.level", "probed"),
            ("ladder.level", "failed"),
            ("ladder.discover", "ok"),
        ]
    );
}

#[test]
fn gate_is_checked_before_a_fresh_cached_level() {
    let mut config = Config::default();
    config.levels[2].min_required = 0.6;
    let mut cache = MemoryCacheStore::new();

    let healthy = ScriptedProbe::clean();
    DiscoveryLadder::new(&healthy, &mut cache, &config)
        .discover_at(&target(), 3, 1_000)
        .expect("healthy run");
    assert!(cache.get(&DiscoveryKey::new(&target(), 3), 1_061).is_some());

    // Levels 1 and 2 have expired; level 2 now comes back noisy (0.9 * 0.5).
    let noisy = ScriptedProbe::with(vec![(
        2,
        Ok(ProbeOutcome::with_warnings(
            Facts::new(),
            (0..5).map(|i| format!("unreadable entry {}", i)).collect(),
        )),
    )]);
    let result = DiscoveryLadder::new(&noisy, &mut cache, &config)
        .discover_at(&target(), 3, 1_061)
        .expect("noisy run");

    assert_eq!(noisy.take_calls(), vec![1, 2]);
    assert!(approx(result.level(2).unwrap().confidence, 0.45));
    assert!(result.level(3).is_none(), "cached level 3 leaked past a closed gate");
    let halt = result.halted.expect("halted");
    assert_eq!(halt.level, 3);
    assert!(halt.reason.contains("below gate"));
    assert!(approx(result.overall_confidence, (1.0 + 0.45) / 2.0));
}

#[test]
fn permission_denied_at_level_one_yields_nothing() {
    let probe = ScriptedProbe::with(vec![(1, Err(ProbeError::Permission("EACCES".into())))]);
    let mut cache = MemoryCacheStore::new();
    let config = Config::default();

    let result = DiscoveryLadder::new(&probe, &mut cache, &config)
        .discover_at(&target(), 3, 1_000)
        .expect("discover");

    assert!(result.levels.is_empty());
    assert_eq!(result.overall_confidence, 0.0);
    assert_eq!(result.halted.expect("halted").level, 1);
    assert_eq!(probe.take_calls(), vec![1]);
    assert!(cache.is_empty());
}
