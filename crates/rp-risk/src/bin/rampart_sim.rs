//! Drives the risk engine over a synthetic random-walk market.
//!
//! Environment:
//! - `RAMPART_POLICY`: path to a JSON policy applied to every account
//! - `RAMPART_TICKS` (default 500), `RAMPART_TICK_MS` (default 10)
//! - `RAMPART_SEED` (default 7)
//! - `RUST_LOG` for log filtering

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rp_risk::{
    AtrSizer, AtrTracker, EngineConfig, KellySizer, PositionSizer, RiskEngine, StopRule,
    TracingNotifier,
};
use rp_types::{AccountState, Bar, OrderIntent, RiskPolicy, Side};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ACCOUNTS: [&str; 3] = ["desk-a", "desk-b", "desk-c"];
const SYMBOL: &str = "BTCUSDT";

struct Desk {
    equity: Decimal,
    price: Decimal,
    position: Decimal,
    entry: Decimal,
    atr: AtrTracker,
    kelly: KellySizer,
}

impl Desk {
    fn new() -> Self {
        Self {
            equity: Decimal::from(100_000),
            price: Decimal::from(100),
            position: Decimal::ZERO,
            entry: Decimal::ZERO,
            atr: AtrTracker::default(),
            kelly: KellySizer::new(Decimal::new(5, 1), Decimal::new(20, 2), 10),
        }
    }

    fn account(&self, id: &str) -> AccountState {
        let invested = self.position * self.price;
        let state = AccountState::new(id, self.equity - invested, self.equity);
        if self.position.is_zero() {
            state
        } else {
            state.with_position(SYMBOL, self.position, self.entry)
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn decimal(x: f64) -> Decimal {
    Decimal::from_f64(x).unwrap_or(Decimal::ZERO).round_dp(6)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = EngineConfig::default();
    if let Ok(path) = std::env::var("RAMPART_POLICY") {
        let json = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading policy file {path}"))?;
        config.default_policy =
            RiskPolicy::from_json(&json).with_context(|| format!("loading policy {path}"))?;
        info!(%path, policy = %config.default_policy.name, "policy loaded");
    }

    let ticks: u64 = env_or("RAMPART_TICKS", 500);
    let tick_ms: u64 = env_or("RAMPART_TICK_MS", 10);
    let mut rng = StdRng::seed_from_u64(env_or("RAMPART_SEED", 7));

    let engine = Arc::new(RiskEngine::new(config, Arc::new(TracingNotifier))?);
    let atr_sizer = AtrSizer::new(Decimal::new(1, 2), Decimal::from(2), Decimal::new(20, 2));
    let mut desks: HashMap<&str, Desk> = ACCOUNTS.iter().map(|id| (*id, Desk::new())).collect();

    let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
    for tick in 0..ticks {
        interval.tick().await;

        // Market move: mostly noise, occasionally a crash.
        for desk in desks.values_mut() {
            let shock = if rng.random_bool(0.002) { -0.15 } else { 0.0 };
            let r = decimal(rng.random_range(-0.02..0.0205) + shock);
            let prev = desk.price;
            desk.price = (desk.price * (Decimal::ONE + r)).max(Decimal::ONE);
            desk.equity += desk.position * (desk.price - prev);

            let spread = desk.price * decimal(rng.random_range(0.001..0.01));
            let bar = Bar::new(
                Utc::now(),
                prev,
                desk.price.max(prev) + spread,
                desk.price.min(prev) - spread,
                desk.price,
                Decimal::from(1_000),
            );
            desk.atr.update(&bar);
        }

        let snapshots: Vec<AccountState> = ACCOUNTS.iter().map(|id| desks[id].account(id)).collect();
        engine.update_batch(&snapshots);

        for id in ACCOUNTS {
            let Some(desk) = desks.get_mut(id) else { continue };

            // Exit on stop.
            if let Some(trigger) = engine.stops().on_price(id, SYMBOL, desk.price) {
                let pnl = (trigger.trigger_price - desk.entry) * desk.position;
                desk.kelly.update_statistics(pnl);
                if pnl < Decimal::ZERO {
                    engine.record_realized_loss(id, -pnl);
                }
                desk.position = Decimal::ZERO;
                continue;
            }
            if let Some(atr) = desk.atr.value() {
                engine.stops().update_atr(id, SYMBOL, atr);
            }

            // Entry every 10 ticks when flat.
            if !desk.position.is_zero() || tick % 10 != 0 {
                continue;
            }
            let mut req = engine.sizing_request(id, desk.equity, desk.price);
            let size = match desk.atr.value() {
                Some(atr) if desk.kelly.statistics().trades() < desk.kelly.min_trades => {
                    req = req.with_atr(atr);
                    atr_sizer.size(&req)
                }
                _ => desk.kelly.size(&req),
            }
            .round_dp(4);
            if size.is_zero() {
                continue;
            }

            let order = OrderIntent::market(id, SYMBOL, Side::Buy, size, desk.price);
            let decision = engine.check(&order, &desk.account(id));
            if decision.allowed {
                desk.position = size;
                desk.entry = desk.price;
                engine.stops().open(
                    id,
                    SYMBOL,
                    Side::Buy,
                    desk.price,
                    StopRule::Trailing { pct: Decimal::new(3, 2) },
                )?;
            }
        }
    }

    for id in ACCOUNTS {
        if let Some(snapshot) = engine.latest_snapshot(id) {
            println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
        }
    }
    println!("gate: {}", serde_json::to_string_pretty(&engine.gate_stats())?);
    println!("sink: {}", serde_json::to_string(&engine.sink_stats())?);
    if let Some(stats) = engine.shutdown() {
        println!("dispatch: {}", serde_json::to_string(&stats)?);
    }
    Ok(())
}
