use std::process::ExitCode;

use qtrader_strategy::register_builtins;

fn main() -> ExitCode {
    register_builtins();
    match qtrader_cli::run_app() {
        Ok(code) => ExitCode::from(code.clamp(0, u8::MAX as i32) as u8),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}
