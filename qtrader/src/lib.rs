#![allow(ambiguous_glob_reexports)]

//! QTrader aggregate crate that re-exports the main components for
//! downstream users.

pub use qtrader_account as account;
pub use qtrader_cli;
pub use qtrader_config as config;
pub use qtrader_core as core;
pub use qtrader_data as data;
pub use qtrader_engine as engine;
pub use qtrader_strategy as strategy;
pub use qtrader_trading as trading;

/// Convenience entrypoint to run the CLI directly from the facade crate.
pub fn run_cli() -> anyhow::Result<i32> {
    qtrader_cli::run_app()
}

/// Convenience prelude to pull commonly used items into scope.
pub mod prelude {
    pub use qtrader_account::*;
    pub use qtrader_config::*;
    pub use qtrader_core::*;
    pub use qtrader_data::*;
    pub use qtrader_engine::*;
    pub use qtrader_strategy::{register_builtins, Strategy, *};
    pub use qtrader_trading::*;
}
