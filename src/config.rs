use std::path::PathBuf;
use std::str::FromStr;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightConfig {
    pub default_weight: f64,
    pub min_weight: f64,
    pub max_weight: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self { default_weight: 1.0, min_weight: 0.10, max_weight: 3.00 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplorationConfig {
    pub epsilon: f64,
    pub cooldown_steps: u32,
    /// Winners scoring below this may be overridden by exploration.
    pub soft_threshold: f64,
    /// Score ceiling applied to forced decisions.
    pub forced_score_cap: f64,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self { epsilon: 0.05, cooldown_steps: 10, soft_threshold: 0.35, forced_score_cap: 0.55 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LearnerConfig {
    pub learning_rate: f64,
    pub pnl_clip: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self { learning_rate: 0.05, pnl_clip: 3.0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardConfig {
    pub min_samples: u64,
    pub cooldown_trades: u64,
    pub grace_trades: u64,
    pub rollback_drop: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self { min_samples: 30, cooldown_trades: 100, grace_trades: 30, rollback_drop: 0.05 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub every_n_trades: u64,
    pub min_improve: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { every_n_trades: 50, min_improve: 0.01 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvolutionConfig {
    pub generations: usize,
    pub population_size: usize,
    pub elite_k: usize,
    pub mutation_rate: f64,
    pub parallel: bool,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self { generations: 5, population_size: 20, elite_k: 5, mutation_rate: 0.2, parallel: false }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub weights: WeightConfig,
    pub exploration: ExplorationConfig,
    pub learner: LearnerConfig,
    pub guard: GuardConfig,
    pub scheduler: SchedulerConfig,
    pub evolution: EvolutionConfig,
    pub seed: u64,
    pub state_dir: PathBuf,
    pub regime_min_window: usize,
    pub feature_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            weights: WeightConfig::default(),
            exploration: ExplorationConfig::default(),
            learner: LearnerConfig::default(),
            guard: GuardConfig::default(),
            scheduler: SchedulerConfig::default(),
            evolution: EvolutionConfig::default(),
            seed: 42,
            state_dir: PathBuf::from("./state"),
            regime_min_window: 20,
            feature_window: 50,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Config::default();
        Self {
            weights: WeightConfig {
                default_weight: env_or("ADAPT_WEIGHT_DEFAULT", d.weights.default_weight),
                min_weight: env_or("ADAPT_WEIGHT_MIN", d.weights.min_weight),
                max_weight: env_or("ADAPT_WEIGHT_MAX", d.weights.max_weight),
            },
            exploration: ExplorationConfig {
                epsilon: env_or("ADAPT_EPSILON", d.exploration.epsilon),
                cooldown_steps: env_or("ADAPT_EXPLORE_COOLDOWN", d.exploration.cooldown_steps),
                soft_threshold: env_or("ADAPT_SOFT_THRESHOLD", d.exploration.soft_threshold),
                forced_score_cap: env_or("ADAPT_FORCED_CAP", d.exploration.forced_score_cap),
            },
            learner: LearnerConfig {
                learning_rate: env_or("ADAPT_LEARNING_RATE", d.learner.learning_rate),
                pnl_clip: env_or("ADAPT_PNL_CLIP", d.learner.pnl_clip),
            },
            guard: GuardConfig {
                min_samples: env_or("ADAPT_MIN_SAMPLES", d.guard.min_samples),
                cooldown_trades: env_or("ADAPT_UPGRADE_COOLDOWN", d.guard.cooldown_trades),
                grace_trades: env_or("ADAPT_GRACE_TRADES", d.guard.grace_trades),
                rollback_drop: env_or("ADAPT_ROLLBACK_DROP", d.guard.rollback_drop),
            },
            scheduler: SchedulerConfig {
                every_n_trades: env_or("ADAPT_EVERY_N_TRADES", d.scheduler.every_n_trades),
                min_improve: env_or("ADAPT_MIN_IMPROVE", d.scheduler.min_improve),
            },
            evolution: EvolutionConfig {
                generations: env_or("ADAPT_GENERATIONS", d.evolution.generations),
                population_size: env_or("ADAPT_POPULATION", d.evolution.population_size),
                elite_k: env_or("ADAPT_ELITE_K", d.evolution.elite_k),
                mutation_rate: env_or("ADAPT_MUTATION_RATE", d.evolution.mutation_rate),
                parallel: env_flag("ADAPT_PARALLEL_EVAL", d.evolution.parallel),
            },
            seed: env_or("ADAPT_SEED", d.seed),
            state_dir: std::env::var("ADAPT_STATE_DIR").map(PathBuf::from).unwrap_or(d.state_dir),
            regime_min_window: env_or("ADAPT_REGIME_MIN_WINDOW", d.regime_min_window),
            feature_window: env_or("ADAPT_FEATURE_WINDOW", d.feature_window),
        }
    }

    /// Same defaults, state rooted at `dir`.
    pub fn with_state_dir(dir: impl Into<PathBuf>) -> Self {
        Self { state_dir: dir.into(), ..Self::default() }
    }

    pub fn weights_path(&self) -> PathBuf {
        self.state_dir.join("weights.json")
    }

    pub fn live_strategy_path(&self) -> PathBuf {
        self.state_dir.join("strategy_live.json")
    }

    pub fn previous_strategy_path(&self) -> PathBuf {
        self.state_dir.join("strategy_previous.json")
    }

    pub fn guard_path(&self) -> PathBuf {
        self.state_dir.join("guard.json")
    }
}
