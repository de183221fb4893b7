use std::process::ExitCode;

fn main() -> ExitCode {
    match telemetry_recovery::run() {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(error) => {
            eprintln!("telemetry-recovery: {error}");
            ExitCode::FAILURE
        }
    }
}
