//! Risk control engine for Rampart.
//!
//! Provides:
//! - Pre-trade admission control with ordered, short-circuiting checks
//! - Continuous per-account risk monitoring (VaR, CVaR, drawdown, stress)
//! - Sticky per-account circuit breakers
//! - Fixed-fraction, Kelly and ATR position sizing
//! - Fixed, trailing and ATR stop-losses
//! - Non-blocking violation delivery via channels

pub mod alerts;
pub mod circuit_breaker;
pub mod engine;
pub mod gate;
pub mod metrics;
pub mod monitor;
pub mod rules;
pub mod sink;
pub mod sizing;
pub mod stops;
pub mod store;
pub mod volatility;

pub use alerts::{RuleViolation, ViolationKind, ViolationSeverity};
pub use circuit_breaker::{BreakerTrip, CircuitBreakerBoard};
pub use engine::{EngineConfig, RiskEngine};
pub use gate::{GateDecision, GateStats, PreTradeGate};
pub use metrics::{RiskMetricsCalculator, RiskSnapshot, StressResult};
pub use monitor::ContinuousRiskMonitor;
pub use rules::{Rule, RuleState};
pub use sink::{
    DispatchPolicy, DispatchStats, NotificationDispatcher, Notifier, SinkStats, TracingNotifier,
    ViolationSink,
};
pub use sizing::{AtrSizer, FixedFractionSizer, KellySizer, PositionSizer, SizingRequest};
pub use stops::{PositionStop, StopLossEngine, StopRule, StopTrigger};
pub use store::RiskPolicyStore;
pub use volatility::AtrTracker;
