//! Shared setup for the integration tests: an engine wired to the
//! in-memory broker.

#![allow(dead_code)]

use std::sync::Arc;

use bracket_domain::{Contracts, Price, Side, TradeSignal};
use bracket_exec::StubBroker;
use bracketd::{Config, Engine, EventBus};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub fn p(value: Decimal) -> Price {
    Price::new(value).unwrap()
}

/// Test config trading `size` contracts per entry.
pub fn config(size: u32) -> Config {
    let mut config = Config::test();
    config.trading.position_size = Contracts::new(size).unwrap();
    config
}

pub struct TestEngine {
    pub broker: Arc<StubBroker>,
    pub engine: Arc<Engine<StubBroker>>,
    pub bus: Arc<EventBus>,
}

pub fn engine_with(config: Config, broker: StubBroker) -> TestEngine {
    let broker = Arc::new(broker);
    let bus = Arc::new(EventBus::new(1000));
    let engine = Arc::new(Engine::new(broker.clone(), &config, bus.clone()));
    TestEngine { broker, engine, bus }
}

/// Flat broker quoting 2650.
pub fn engine(config: Config) -> TestEngine {
    let broker = StubBroker::new(config.trading.instrument.clone(), p(dec!(2650)));
    engine_with(config, broker)
}

/// 50 ticks of stop, 100 ticks of target: 5.0 and 10.0 on MGC.
pub fn signal(side: Side, entry: Decimal) -> TradeSignal {
    TradeSignal {
        side,
        entry_price: p(entry),
        stop_distance_ticks: 50,
        target_distance_ticks: 100,
        risk_reward_ratio: dec!(2),
    }
}
