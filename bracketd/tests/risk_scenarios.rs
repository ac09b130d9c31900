//! Risk transitions driven through the engine: partial exit racing a
//! trailing update, and the stop ratchet over price paths.

mod common;

use std::time::Duration;

use bracket_domain::{Price, ProtectiveKind, Side};
use bracket_engine::RiskSettings;
use bracket_exec::{GateConfig, MutationCategory, StubBroker, StubFailure, StubOp};
use bracketd::RiskOutcome;
use common::{config, engine, engine_with, p, signal};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// =============================================================================
// Partial exit vs trailing
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trailing_defers_while_partial_exit_replaces_target() {
    let mut cfg = config(8);
    cfg.gate = GateConfig::default();
    cfg.risk = RiskSettings {
        break_even_enabled: false,
        early_break_even_ticks: None,
        ..RiskSettings::default()
    };
    let broker = StubBroker::new(cfg.trading.instrument.clone(), p(dec!(2650)))
        .with_latency(Duration::from_millis(20));
    let t = engine_with(cfg, broker);

    let id = t.engine.open_position(signal(Side::Long, dec!(2650))).await.unwrap();
    let old_target = t.engine.ledger().tracked(ProtectiveKind::Target).await.unwrap();
    t.broker.set_price(p(dec!(2655)));

    // 1R: partial exit of 4
    let partial = tokio::spawn({
        let engine = t.engine.clone();
        async move { engine.risk().on_quote(p(dec!(2655))).await }
    });

    // Wait until the target replacement holds protective-placement
    let mut saw_placement = false;
    for _ in 0..2000 {
        if t.engine.gate().is_held(MutationCategory::ProtectivePlacement) {
            saw_placement = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(saw_placement, "target replacement never started");

    let trailing = t.engine.risk().on_quote(p(dec!(2656))).await;
    assert!(trailing
        .iter()
        .any(|o| matches!(o, RiskOutcome::Deferred { action: "trailing", .. })));
    assert!(!trailing
        .iter()
        .any(|o| matches!(o, RiskOutcome::Applied { action: "trailing" })));

    let outcomes = partial.await.unwrap();
    assert!(outcomes.contains(&RiskOutcome::Applied { action: "partial_exit" }));

    // Stop resized and locked at entry + 0.5R, untouched by trailing
    let position = t.engine.ledger().position_if(id).await.unwrap();
    assert_eq!(position.quantity.get(), 4);
    assert_eq!(t.broker.position().unwrap().size, 4);
    let stops = t.broker.orders_of(ProtectiveKind::Stop);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].size, 4);
    assert_eq!(stops[0].price, Some(p(dec!(2652.5))));

    let targets = t.broker.orders_of(ProtectiveKind::Target);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].size, 4);
    assert_ne!(targets[0].order_id, old_target.order_id);
}

#[tokio::test]
async fn test_uncancelled_old_target_is_resized_not_doubled() {
    let mut cfg = config(8);
    cfg.risk = RiskSettings {
        break_even_enabled: false,
        trailing_enabled: false,
        early_break_even_ticks: None,
        ..RiskSettings::default()
    };
    let t = engine(cfg);

    t.engine.open_position(signal(Side::Long, dec!(2650))).await.unwrap();
    let old_target = t.engine.ledger().tracked(ProtectiveKind::Target).await.unwrap();
    t.broker.set_price(p(dec!(2655)));
    // The broker acknowledges the target cancel but keeps the order working
    t.broker.fail_next(StubOp::Cancel, StubFailure::Ignored);

    let outcomes = t.engine.risk().on_quote(p(dec!(2655))).await;
    assert!(outcomes.contains(&RiskOutcome::Applied { action: "partial_exit" }));
    assert_eq!(t.broker.position().unwrap().size, 4);

    let targets = t.broker.orders_of(ProtectiveKind::Target);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].order_id, old_target.order_id);
    assert_eq!(targets[0].size, 8);
    assert_eq!(
        t.engine.ledger().tracked(ProtectiveKind::Target).await.unwrap().order_id,
        old_target.order_id
    );

    // The watchdog resizes the surviving target in place
    t.engine.reconcile_now().await;
    let targets = t.broker.orders_of(ProtectiveKind::Target);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].order_id, old_target.order_id);
    assert_eq!(targets[0].size, 4);
    assert_eq!(t.broker.orders_of(ProtectiveKind::Stop).len(), 1);
    assert!(t.engine.reconcile_now().await.is_converged());
}

// =============================================================================
// Ratchet
// =============================================================================

async fn stop_path(side: Side, entry: Decimal, quotes: &[Decimal]) -> Vec<Price> {
    let t = engine(config(2));
    t.engine.open_position(signal(side, entry)).await.unwrap();

    let mut stops = vec![t.engine.ledger().position().await.unwrap().stop_price];
    for quote in quotes {
        t.engine.risk().on_quote(p(*quote)).await;
        let position = t.engine.ledger().position().await.unwrap();
        let listed = t.broker.orders_of(ProtectiveKind::Stop);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].price, Some(position.stop_price));
        stops.push(position.stop_price);
    }
    stops
}

#[tokio::test]
async fn test_long_stop_never_loosens() {
    let quotes = [
        dec!(2651),
        dec!(2654),
        dec!(2655),
        dec!(2654),
        dec!(2657),
        dec!(2655.5),
        dec!(2658),
        dec!(2657),
        dec!(2659.5),
    ];
    let stops = stop_path(Side::Long, dec!(2650), &quotes).await;

    assert!(stops.windows(2).all(|w| w[1] >= w[0]), "{stops:?}");
    assert!(stops.last().unwrap() > stops.first().unwrap());
}

#[tokio::test]
async fn test_short_stop_never_loosens() {
    let quotes = [
        dec!(2649),
        dec!(2646),
        dec!(2645),
        dec!(2646.5),
        dec!(2643),
        dec!(2644),
        dec!(2641),
        dec!(2642.5),
    ];
    let stops = stop_path(Side::Short, dec!(2650), &quotes).await;

    assert!(stops.windows(2).all(|w| w[1] <= w[0]), "{stops:?}");
    assert!(stops.last().unwrap() < stops.first().unwrap());
}

#[tokio::test]
async fn test_break_even_and_trailing_in_one_quote() {
    let t = engine(config(1));
    t.engine.open_position(signal(Side::Long, dec!(2650))).await.unwrap();

    // 1R with a single contract: partial only completes, break-even then
    // trailing both apply
    let outcomes = t.engine.risk().on_quote(p(dec!(2655))).await;
    assert!(outcomes.contains(&RiskOutcome::Applied { action: "break_even" }));
    assert!(outcomes.contains(&RiskOutcome::Applied { action: "trailing" }));

    let position = t.engine.ledger().position().await.unwrap();
    assert_eq!(position.stop_price, p(dec!(2653)));
    assert_eq!(t.broker.orders_of(ProtectiveKind::Stop)[0].price, Some(p(dec!(2653))));
}
