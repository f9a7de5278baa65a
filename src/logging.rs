//! Structured logging for the adaptation core.
//!
//! Every record is one JSON object per line:
//! `{ts, run_id, seq, lvl, component, event, msg, <top-level keys>, data}`.
//!
//! Records go to stdout (disable with `LOG_STDOUT=0`). When `LOG_DIR` is set,
//! a run directory `LOG_DIR/RUN_ID/` additionally receives `events.jsonl`
//! (info and above) and `trace.jsonl` (debug/trace).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Arbiter,   // Per-step variant arbitration, exploration
    Reward,    // Outcome -> weight updates
    Evolution, // Generational search
    Guard,     // Cooldown, grace, rollback checks
    Upgrade,   // Promotion / rollback orchestration
    Persist,   // Snapshot reads and writes
    Regime,    // Market-condition classification
    System,    // Startup, shutdown, summaries
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Arbiter => "arbiter",
            Domain::Reward => "reward",
            Domain::Evolution => "evolution",
            Domain::Guard => "guard",
            Domain::Upgrade => "upgrade",
            Domain::Persist => "persist",
            Domain::Regime => "regime",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    to_stdout: bool,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(f) => Some(Mutex::new(BufWriter::new(f))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let to_stdout = !matches!(std::env::var("LOG_STDOUT").as_deref(), Ok("0") | Ok("false"));

        let (events, trace) = match std::env::var("LOG_DIR") {
            Ok(base) => {
                let run_dir = PathBuf::from(base).join(&run_id);
                if let Err(err) = create_dir_all(&run_dir) {
                    eprintln!("[log] failed to create run dir: {}", err);
                }
                let _ = std::fs::write(
                    run_dir.join("manifest.json"),
                    json!({
                        "run_id": run_id,
                        "ts": ts_now(),
                        "pid": process::id(),
                        "log_dir": run_dir.to_string_lossy(),
                    })
                    .to_string(),
                );
                (
                    open_sink(run_dir.join("events.jsonl")),
                    open_sink(run_dir.join("trace.jsonl")),
                )
            }
            Err(_) => (None, None),
        };

        RunContext {
            run_id,
            to_stdout,
            events,
            trace,
        }
    })
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["variant", "regime", "snapshot", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn build_record(
    run_id: &str,
    level: Level,
    component: &str,
    event: &str,
    fields: Map<String, Value>,
) -> Value {
    let (mut top, data) = split_fields(fields);
    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));

    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(run_id));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));
    Value::Object(entry)
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let line = build_record(&ctx.run_id, level, component, event, fields).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    if ctx.to_stdout {
        println!("{}", line);
    }
}

/// Arbitration outcome with the alternatives that were considered.
pub fn log_decision(
    variant: &str,
    regime: &str,
    allow: bool,
    score: f64,
    forced_reason: Option<&str>,
    alternatives: &[(&str, f64)], // (variant, adjusted score)
) {
    let alts: Vec<Value> = alternatives
        .iter()
        .map(|(v, s)| json!({"variant": v, "adj_score": s}))
        .collect();

    log(
        Level::Debug,
        Domain::Arbiter,
        "decision",
        obj(&[
            ("variant", v_str(variant)),
            ("regime", v_str(regime)),
            ("allow", Value::Bool(allow)),
            ("score", v_num(score)),
            ("forced_reason", forced_reason.map(v_str).unwrap_or(Value::Null)),
            ("alternatives", Value::Array(alts)),
        ]),
    );
}

pub fn log_reward(variant: &str, regime: &str, reward: f64, weight_after: f64) {
    log(
        Level::Debug,
        Domain::Reward,
        "weight_update",
        obj(&[
            ("variant", v_str(variant)),
            ("regime", v_str(regime)),
            ("reward", v_num(reward)),
            ("weight", v_num(weight_after)),
        ]),
    );
}

pub fn log_generation(generation: usize, best: f64, avg: f64, best_ever: f64) {
    log(
        Level::Debug,
        Domain::Evolution,
        "generation",
        obj(&[
            ("generation", json!(generation)),
            ("best", v_num(best)),
            ("avg", v_num(avg)),
            ("best_ever", v_num(best_ever)),
        ]),
    );
}

pub fn log_guard(check: &str, result: &str, trade_count: u64) {
    log(
        Level::Info,
        Domain::Guard,
        check,
        obj(&[
            ("result", v_str(result)),
            ("trade_count", json!(trade_count)),
        ]),
    );
}

pub fn log_upgrade(event: &str, reason: &str, old_fitness: Option<f64>, new_fitness: Option<f64>) {
    log(
        Level::Info,
        Domain::Upgrade,
        event,
        obj(&[
            ("reason", v_str(reason)),
            ("old_fitness", old_fitness.map(v_num).unwrap_or(Value::Null)),
            ("new_fitness", new_fitness.map(v_num).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_persist_failure(what: &str, err: &dyn std::fmt::Display) {
    log(
        Level::Warn,
        Domain::Persist,
        "write_failed",
        obj(&[("target", v_str(what)), ("msg", v_str(&err.to_string()))]),
    );
}

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}
