//! End-to-end backtest loop behavior: event ordering, accounting, and
//! artifact determinism.

mod common;

use std::fs;
use std::sync::Arc;

use common::{base_config, date, events, flat_provider, params, setup, ScriptedConfig, ScriptedOrder};
use qtrader_engine::{Engine, ManualClock, RunOutcome};
use rust_decimal::Decimal;
use tempfile::tempdir;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_at(common::dt(2024, 3, 1, 8, 0)))
}

#[test]
fn daily_event_sequence_fires_once_and_in_order() {
    setup();
    let temp = tempdir().unwrap();
    let start = date(2024, 1, 2);
    let end = date(2024, 1, 3);
    let provider = flat_provider(start, end, &[]);
    let config = base_config(temp.path(), start, end);

    let mut engine = Engine::new_run(
        config,
        params(&ScriptedConfig::default()),
        provider,
        clock(),
    )
    .unwrap();
    let outcome = engine.execute().unwrap();
    assert_eq!(outcome, RunOutcome::Finished);

    let trace = events(engine.context());
    let expected = vec![
        "initialize:2024-01-02 00:00:00".to_string(),
        "before_trading:2024-01-02 09:15:00".to_string(),
        "handle_bar:2024-01-02 10:00:00".to_string(),
        "after_trading:2024-01-02 15:05:00".to_string(),
        "broker_settle:2024-01-02 15:30:00".to_string(),
        "before_trading:2024-01-03 09:15:00".to_string(),
        "handle_bar:2024-01-03 10:00:00".to_string(),
        "after_trading:2024-01-03 15:05:00".to_string(),
        "broker_settle:2024-01-03 15:30:00".to_string(),
        "on_end:2024-01-03 15:30:00".to_string(),
    ];
    // `initialize` runs before any day, so its timestamp is the epoch
    // default; compare from the first day onward and the hook names in full.
    let hooks: Vec<&str> = trace.iter().map(|e| e.split(':').next().unwrap()).collect();
    let expected_hooks: Vec<&str> = expected
        .iter()
        .map(|e| e.split(':').next().unwrap())
        .collect();
    assert_eq!(hooks, expected_hooks);
    assert_eq!(&trace[1..], &expected[1..]);

    // One equity point per settled day.
    assert_eq!(engine.context().portfolio.history.len(), 2);
}

#[test]
fn buy_then_sell_accounts_to_the_cent() {
    setup();
    let temp = tempdir().unwrap();
    let start = date(2024, 1, 2);
    let end = date(2024, 1, 3);
    let provider = flat_provider(start, end, &[(date(2024, 1, 3), Decimal::from(11))]);
    let config = base_config(temp.path(), start, end);

    let script = ScriptedConfig {
        orders: vec![
            ScriptedOrder {
                date: date(2024, 1, 2),
                amount: 100,
                limit: None,
            },
            ScriptedOrder {
                date: date(2024, 1, 3),
                amount: -100,
                limit: None,
            },
        ],
        ..Default::default()
    };

    let mut engine = Engine::new_run(config, params(&script), provider, clock()).unwrap();
    engine.execute().unwrap();

    let portfolio = &engine.context().portfolio;
    // Buy 100 @ 10 (fee 5), sell 100 @ 11 (fee 5 + tax 1.10).
    assert_eq!(portfolio.cash, Decimal::new(100_008_890, 2));
    assert_eq!(portfolio.net_worth, Decimal::new(100_008_890, 2));
    assert!(engine.context().positions.is_empty());

    // Day one closes with the long position marked at 10.00.
    let history = &portfolio.history;
    assert_eq!(history[0].net_worth, Decimal::from(999_995));
    assert_eq!(history[1].net_worth, Decimal::new(100_008_890, 2));
}

#[test]
fn identical_runs_produce_byte_identical_artifacts() {
    setup();
    let start = date(2024, 1, 2);
    let end = date(2024, 1, 10);
    let script = ScriptedConfig {
        orders: vec![
            ScriptedOrder {
                date: date(2024, 1, 3),
                amount: 300,
                limit: None,
            },
            ScriptedOrder {
                date: date(2024, 1, 8),
                amount: -200,
                limit: None,
            },
            // A limit that rests and expires at settlement.
            ScriptedOrder {
                date: date(2024, 1, 9),
                amount: 100,
                limit: Some(Decimal::from(9)),
            },
        ],
        ..Default::default()
    };

    let run = |root: &std::path::Path| -> (String, String, String) {
        let provider = flat_provider(start, end, &[(date(2024, 1, 8), Decimal::from(12))]);
        let config = base_config(root, start, end);
        let mut engine = Engine::new_run(config, params(&script), provider, clock()).unwrap();
        engine.execute().unwrap();
        let ws = engine.workspace();
        (
            fs::read_to_string(ws.equity_csv()).unwrap(),
            fs::read_to_string(ws.orders_csv()).unwrap(),
            fs::read_to_string(ws.positions_csv()).unwrap(),
        )
    };

    let first_dir = tempdir().unwrap();
    let second_dir = tempdir().unwrap();
    let first = run(first_dir.path());
    let second = run(second_dir.path());
    assert_eq!(first.0, second.0, "equity.csv must be deterministic");
    assert_eq!(first.1, second.1, "orders.csv must be deterministic");
    assert_eq!(first.2, second.2, "daily_positions.csv must be deterministic");

    // The resting 9.00 limit expired at its day's settlement and left the
    // book; only the two fills remain in the durable order log.
    let filled_rows = first.1.lines().skip(1).count();
    assert_eq!(filled_rows, 2);
    assert!(!first.1.contains("expired"));
}

#[test]
fn strategy_failures_never_stop_the_run() {
    setup();
    let temp = tempdir().unwrap();
    let start = date(2024, 1, 2);
    let end = date(2024, 1, 3);
    let provider = flat_provider(start, end, &[]);
    let config = base_config(temp.path(), start, end);

    let script = ScriptedConfig {
        fail_on_date: Some(date(2024, 1, 2)),
        orders: vec![ScriptedOrder {
            date: date(2024, 1, 3),
            amount: 100,
            limit: None,
        }],
        ..Default::default()
    };
    let mut engine = Engine::new_run(config, params(&script), provider, clock()).unwrap();
    let outcome = engine.execute().unwrap();

    // The day-one failure was isolated; the run completed and day two's
    // order still filled.
    assert_eq!(outcome, RunOutcome::Finished);
    assert_eq!(engine.context().portfolio.history.len(), 2);
    assert_eq!(engine.context().orders.history().len(), 1);
}

#[test]
fn stop_request_interrupts_and_still_runs_on_end() {
    setup();
    let temp = tempdir().unwrap();
    let start = date(2024, 1, 2);
    let end = date(2024, 1, 10);
    let provider = flat_provider(start, end, &[]);
    let config = base_config(temp.path(), start, end);

    let script = ScriptedConfig {
        stop_on_date: Some(date(2024, 1, 4)),
        ..Default::default()
    };
    let mut engine = Engine::new_run(config, params(&script), provider, clock()).unwrap();
    let outcome = engine.execute().unwrap();
    assert_eq!(outcome, RunOutcome::Interrupted);
    assert_eq!(outcome.exit_code(), 1);

    let trace = events(engine.context());
    assert!(trace.last().unwrap().starts_with("on_end:"));
    // Jan 2 and Jan 3 settled; the stop landed on Jan 4's bar.
    assert_eq!(engine.context().portfolio.history.len(), 2);
}
