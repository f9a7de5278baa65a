use std::fs;

use adaptfx::config::{Config, GuardConfig, WeightConfig};
use adaptfx::genome::{GenomeSchema, ENTRY_THRESHOLD, POSITION_SIZE};
use adaptfx::guard::{GuardPhase, SafetyGuard};
use adaptfx::persist::{read_json, write_json_atomic};
use adaptfx::regime::TrendVolClassifier;
use adaptfx::scheduler::{StrategySnapshot, StrategyStore};
use adaptfx::weights::{WeightSnapshot, WeightStore};
use adaptfx::{NoReload, OutcomeRecord, PolicyRegistry, TradingAgent};

#[test]
fn weight_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.json");
    let mut w = WeightStore::new(&WeightConfig::default()).unwrap();
    w.set("TREND", 1.7, Some("trending"));
    w.set("MEAN_REV", 0.4, Some("ranging"));
    w.set("LEGACY", 2.2, None);
    w.save(&path).unwrap();

    let back = WeightStore::load(&path, &WeightConfig::default()).unwrap();
    assert_eq!(back, w);
    assert_eq!(back.get("TREND", Some("trending")), 1.7);
    assert_eq!(back.get("LEGACY", None), 2.2);

    let raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(raw["weights"]["trending::TREND"], 1.7);
    assert_eq!(raw["min_weight"], 0.10);
}

#[test]
fn weight_file_with_bad_entries_keeps_good_ones() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.json");
    fs::write(
        &path,
        r#"{"default_weight":1.0,"min_weight":0.1,"max_weight":3.0,
            "weights":{"trending::TREND":9.0,"ranging::MEAN_REV":"oops","BREAKOUT":0.5}}"#,
    )
    .unwrap();
    let w = WeightStore::load(&path, &WeightConfig::default()).unwrap();
    assert_eq!(w.len(), 2);
    assert_eq!(w.get("TREND", Some("trending")), 3.0);
    assert_eq!(w.get("MEAN_REV", Some("ranging")), 1.0);
    assert_eq!(w.get("BREAKOUT", None), 0.5);
}

#[test]
fn truncated_weight_file_degrades_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.json");
    fs::write(&path, r#"{"default_weight":1.0,"weights":{"A""#).unwrap();
    let w = WeightStore::load(&path, &WeightConfig::default()).unwrap();
    assert!(w.is_empty());
    assert_eq!(w.get("A", None), 1.0);
}

#[test]
fn strategy_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let schema = GenomeSchema::default();
    let store = StrategyStore::new(dir.path().join("live.json"), dir.path().join("prev.json"));

    let mut genome = schema.default_genome();
    genome.set(ENTRY_THRESHOLD, 0.42);
    let current = StrategySnapshot::new(3, schema.default_genome());
    let candidate = StrategySnapshot::new(4, genome).with_meta("fitness", 0.31);
    store.promote(&candidate, &current).unwrap();

    assert_eq!(store.load_live(&schema).unwrap(), candidate);
    assert_eq!(store.load_previous(&schema).unwrap(), current);
}

#[test]
fn out_of_range_strategy_is_clamped_on_load() {
    let dir = tempfile::tempdir().unwrap();
    let schema = GenomeSchema::default();
    let live = dir.path().join("live.json");
    let mut genome = schema.default_genome();
    genome.set(POSITION_SIZE, 4.0);
    write_json_atomic(&live, &StrategySnapshot::new(1, genome)).unwrap();

    let store = StrategyStore::new(&live, dir.path().join("prev.json"));
    let loaded = store.load_live(&schema).unwrap();
    assert_eq!(loaded.genome.get(POSITION_SIZE), Some(0.05));
}

#[test]
fn corrupt_live_strategy_falls_back_to_default_genome() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config::with_state_dir(dir.path());
    fs::write(cfg.live_strategy_path(), b"not json at all").unwrap();
    fs::write(cfg.weights_path(), b"[]").unwrap();

    let agent = TradingAgent::new(cfg, PolicyRegistry::with_defaults(), Box::new(TrendVolClassifier::default()), Box::new(NoReload))
        .unwrap();
    assert_eq!(agent.scheduler().live().version, 0);
    assert_eq!(agent.live_genome(), &GenomeSchema::default().default_genome());
    assert!(agent.weights().is_empty());
}

#[test]
fn atomic_write_leaves_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("doc.json");
    write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
    write_json_atomic(&path, &serde_json::json!({"a": 2})).unwrap();

    let names: Vec<String> = fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["doc.json".to_string()]);
    let v: serde_json::Value = read_json(&path).unwrap().unwrap();
    assert_eq!(v["a"], 2);
}

#[test]
fn failed_write_keeps_previous_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.json");
    let mut w = WeightStore::new(&WeightConfig::default()).unwrap();
    w.set("A", 2.0, None);
    w.save(&path).unwrap();

    // Replace the target with a non-empty directory so the rename fails.
    fs::remove_file(&path).unwrap();
    fs::create_dir_all(path.join("occupied")).unwrap();
    let err = w.save(&path).unwrap_err();
    assert_eq!(err.kind(), "persistence");
    assert!(path.join("occupied").exists());
    let leftovers = fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftovers, 1);
}

#[test]
fn guard_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("guard.json");
    let cfg = GuardConfig::default();
    {
        let mut g = SafetyGuard::load(&cfg, &path);
        g.mark_upgraded(250, 0.4, 0.6);
    }
    let g = SafetyGuard::load(&cfg, &path);
    assert_eq!(g.phase(), GuardPhase::Upgraded);
    assert_eq!(g.state().trade_count_at_apply, Some(250));
    assert_eq!(g.state().baseline_fitness, Some(0.4));
}

#[test]
fn agent_persists_weights_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let features = adaptfx::FeatureSet::new();
    let after = {
        let mut agent = TradingAgent::new(
            Config::with_state_dir(dir.path()),
            PolicyRegistry::with_defaults(),
            Box::new(TrendVolClassifier::default()),
            Box::new(NoReload),
        )
        .unwrap();
        agent.record_outcome(&features, OutcomeRecord::from_pnl(-0.02, "BREAKOUT", "volatile", 0.5));
        agent.weights().get("BREAKOUT", Some("volatile"))
    };
    assert!(after < 1.0);

    let agent = TradingAgent::new(
        Config::with_state_dir(dir.path()),
        PolicyRegistry::with_defaults(),
        Box::new(TrendVolClassifier::default()),
        Box::new(NoReload),
    )
    .unwrap();
    assert_eq!(agent.weights().get("BREAKOUT", Some("volatile")), after);
}

#[test]
fn weight_snapshot_without_weights_key_loads() {
    let snap: WeightSnapshot = serde_json::from_str(r#"{"default_weight":1.5,"min_weight":0.5,"max_weight":2.0}"#).unwrap();
    let w = WeightStore::from_snapshot(snap, &WeightConfig::default()).unwrap();
    assert_eq!(w.get("X", None), 1.5);
    assert_eq!(w.bounds(), (0.5, 2.0));
}
