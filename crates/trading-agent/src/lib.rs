pub mod config;
pub mod market_feed;
pub mod metrics;
pub mod position_manager;
pub mod price_cache;
pub mod scheduler;
pub mod state_manager;
pub mod strategies;
pub mod strategy_manager;

pub use config::{AgentConfig, BreakerConfig, ConfigUpdate, SupervisorConfig};
pub use market_feed::SyntheticFeed;
pub use metrics::AgentMetrics;
pub use position_manager::{ExitEvent, PositionSupervisor, SupervisorTick, TickQuotes};
pub use price_cache::PriceCache;
pub use scheduler::{CycleAction, CycleReport, EngineStatus, SymbolOutcome, TradingEngine};
pub use state_manager::{SqlStateStore, StateStore};
pub use strategies::{
    BreakoutStrategy, MeanReversionStrategy, MomentumStrategy, TrendFollowingStrategy,
};
pub use strategy_manager::{Gathered, StrategyManager, UnitOutcome, UnitReport};
