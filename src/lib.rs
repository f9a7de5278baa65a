//! Adaptive policy arbitration with guarded strategy evolution.
//!
//! Per step, [`arbiter::PolicyArbiter`] picks among registered policy
//! variants using regime-conditioned weights that [`learner::RewardLearner`]
//! adjusts from trade outcomes. On a trade-count cadence,
//! [`scheduler::UpgradeScheduler`] evolves the strategy genome and promotes
//! it behind [`guard::SafetyGuard`]. [`agent::TradingAgent`] ties it together.

pub mod agent;
pub mod arbiter;
pub mod config;
pub mod error;
pub mod evolution;
pub mod features;
pub mod fitness;
pub mod genome;
pub mod guard;
pub mod learner;
pub mod logging;
pub mod persist;
pub mod policy;
pub mod regime;
pub mod scheduler;
pub mod weights;

pub use agent::{TradeVerdict, TradingAgent};
pub use config::Config;
pub use error::{AdaptError, Result};
pub use features::{Candle, FeatureSet};
pub use learner::OutcomeRecord;
pub use policy::{Decision, PolicyRegistry, PolicyVariant};
pub use scheduler::{NoReload, RollbackReport, StrategyReload, UpgradeReport};
