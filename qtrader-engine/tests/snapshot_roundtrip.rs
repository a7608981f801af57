//! Pause/resume and fork semantics: the resume law and fork truncation.

mod common;

use std::fs;
use std::sync::Arc;

use common::{base_config, date, events, flat_provider, params, setup, ScriptedConfig, ScriptedOrder};
use qtrader_engine::{Engine, EngineError, ManualClock, RunOutcome, SnapshotError};
use rust_decimal::Decimal;
use tempfile::tempdir;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_at(common::dt(2024, 2, 1, 8, 0)))
}

#[test]
fn resume_reproduces_the_uninterrupted_run() {
    setup();
    let start = date(2024, 1, 2);
    let end = date(2024, 1, 9);
    let overrides = [(date(2024, 1, 8), Decimal::from(11))];

    let script = |pause: Option<chrono::NaiveDate>| ScriptedConfig {
        orders: vec![
            ScriptedOrder {
                date: date(2024, 1, 3),
                amount: 100,
                limit: None,
            },
            ScriptedOrder {
                date: date(2024, 1, 8),
                amount: -100,
                limit: None,
            },
        ],
        pause_on_date: pause,
        ..Default::default()
    };

    // Reference: run straight through.
    let reference_dir = tempdir().unwrap();
    let mut reference = Engine::new_run(
        base_config(reference_dir.path(), start, end),
        params(&script(None)),
        flat_provider(start, end, &overrides),
        clock(),
    )
    .unwrap();
    assert_eq!(reference.execute().unwrap(), RunOutcome::Finished);
    let reference_equity = fs::read_to_string(reference.workspace().equity_csv()).unwrap();
    let reference_orders = fs::read_to_string(reference.workspace().orders_csv()).unwrap();
    let reference_trace = events(reference.context());

    // Same run, paused on Jan 4's bar.
    let paused_dir = tempdir().unwrap();
    let config = base_config(paused_dir.path(), start, end);
    let mut paused = Engine::new_run(
        config.clone(),
        params(&script(Some(date(2024, 1, 4)))),
        flat_provider(start, end, &overrides),
        clock(),
    )
    .unwrap();
    assert_eq!(paused.execute().unwrap(), RunOutcome::Paused);
    let envelope = paused.workspace().envelope_path("pause");
    assert!(envelope.exists());

    // Resume and finish.
    let mut resumed = Engine::resume(
        &envelope,
        config,
        flat_provider(start, end, &overrides),
        clock(),
    )
    .unwrap();
    assert_eq!(resumed.execute().unwrap(), RunOutcome::Finished);

    let resumed_equity = fs::read_to_string(resumed.workspace().equity_csv()).unwrap();
    let resumed_orders = fs::read_to_string(resumed.workspace().orders_csv()).unwrap();
    assert_eq!(resumed_equity, reference_equity);
    assert_eq!(resumed_orders, reference_orders);

    // The combined hook trace is the uninterrupted one: nothing re-fired,
    // nothing skipped (initialize ran only in the fresh run).
    assert_eq!(events(resumed.context()), reference_trace);
}

#[test]
fn fork_truncates_history_and_inherits_only_filled_orders() {
    setup();
    let start = date(2024, 1, 2);
    let end = date(2024, 1, 31);
    // A distinctive close on Jan 12 proves the fork's cost basis source.
    let overrides = [(date(2024, 1, 12), Decimal::from(12))];

    // Parent: long 100 from Jan 3; an open resting limit and a pause on
    // Jan 18.
    let parent_script = ScriptedConfig {
        orders: vec![
            ScriptedOrder {
                date: date(2024, 1, 3),
                amount: 100,
                limit: None,
            },
            ScriptedOrder {
                date: date(2024, 1, 18),
                amount: 100,
                limit: Some(Decimal::from(9)),
            },
        ],
        pause_on_date: Some(date(2024, 1, 18)),
        ..Default::default()
    };

    let parent_dir = tempdir().unwrap();
    let mut parent = Engine::new_run(
        base_config(parent_dir.path(), start, end),
        params(&parent_script),
        flat_provider(start, end, &overrides),
        clock(),
    )
    .unwrap();
    assert_eq!(parent.execute().unwrap(), RunOutcome::Paused);
    assert_eq!(parent.context().orders.open_orders().len(), 1);
    let envelope = parent.workspace().envelope_path("pause");

    // Fork at Jan 15 with a new strategy that exits the inherited long.
    let fork_date = date(2024, 1, 15);
    let fork_script = ScriptedConfig {
        orders: vec![ScriptedOrder {
            date: date(2024, 1, 16),
            amount: -100,
            limit: None,
        }],
        ..Default::default()
    };
    let fork_dir = tempdir().unwrap();
    let mut forked = Engine::fork(
        &envelope,
        Some(fork_date),
        base_config(fork_dir.path(), start, end),
        params(&fork_script),
        flat_provider(start, end, &overrides),
        clock(),
        true,
    )
    .unwrap();

    // Seeded from the Jan 12 settlement snapshot: cost = that day's close,
    // fully available, nothing opened today.
    {
        let position = forked
            .context()
            .position(common::SYMBOL, qtrader_core::Direction::Long)
            .expect("fork inherits the long position");
        assert_eq!(position.total_amount, 100);
        assert_eq!(position.available_amount, 100);
        assert_eq!(position.today_open_amount, 0);
        assert_eq!(position.avg_cost, Decimal::from(12));
    }
    // History truncated strictly before the fork date.
    let history = &forked.context().portfolio.history;
    assert_eq!(history.last().unwrap().date, date(2024, 1, 12));
    assert!(history.iter().all(|point| point.date < fork_date));
    // Only the parent's filled order survives; the open limit is gone.
    let inherited = forked.context().orders.all_known();
    assert_eq!(inherited.len(), 1);
    assert_eq!(inherited[0].status, qtrader_core::OrderStatus::Filled);
    // Reinitialized fork starts with a clean user dictionary.
    assert!(events(forked.context()).is_empty());

    assert_eq!(forked.execute().unwrap(), RunOutcome::Finished);

    // The fork's order log: parent fills before the fork date, then its own
    // orders, with no id collision.
    let orders_csv = fs::read_to_string(forked.workspace().orders_csv()).unwrap();
    let data_rows: Vec<&str> = orders_csv.lines().skip(1).collect();
    assert_eq!(data_rows.len(), 2);
    assert!(data_rows[0].starts_with("O-000001,"));
    assert!(data_rows[0].contains(",buy,"));
    assert!(data_rows[1].starts_with("O-000003,"));
    assert!(data_rows[1].contains(",sell,"));
    assert!(!orders_csv.contains("open"));

    // New equity points begin at the fork date; the weekend gap is intact.
    let history = &forked.context().portfolio.history;
    assert!(history.iter().any(|point| point.date == fork_date));
    assert!(!history.iter().any(|point| point.date == date(2024, 1, 13)));
    assert!(!history.iter().any(|point| point.date == date(2024, 1, 14)));

    // Exiting the inherited long at 10 against a 12 cost books -200.
    let sell = forked
        .context()
        .orders
        .history()
        .iter()
        .find(|order| order.side == qtrader_core::Side::Sell)
        .unwrap()
        .clone();
    assert_eq!(sell.filled_price, Some(Decimal::from(10)));
}

#[test]
fn terminal_envelopes_refuse_to_rehydrate() {
    setup();
    let start = date(2024, 1, 2);
    let end = date(2024, 1, 3);
    let dir = tempdir().unwrap();
    let config = base_config(dir.path(), start, end);
    let mut engine = Engine::new_run(
        config.clone(),
        params(&ScriptedConfig::default()),
        flat_provider(start, end, &[]),
        clock(),
    )
    .unwrap();
    assert_eq!(engine.execute().unwrap(), RunOutcome::Finished);

    let final_envelope = engine.workspace().envelope_path("final");
    assert!(final_envelope.exists());
    let err = Engine::resume(
        &final_envelope,
        config,
        flat_provider(start, end, &[]),
        clock(),
    )
    .err()
    .expect("finished envelopes are not resumable");
    assert!(matches!(
        err,
        EngineError::Snapshot(SnapshotError::NotResumable(_))
    ));
}
