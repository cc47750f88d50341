// Module declarations
pub mod commands;
pub mod config;
pub mod destination;
pub mod error;
pub mod extensions;
pub mod sync;
pub mod validation;

use std::process::ExitCode;

pub use commands::Cli;
pub use error::{Error, Result};

/// Run one parsed invocation, printing the cause chain on failure
pub fn run(cli: Cli) -> ExitCode {
    match commands::execute(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {:#}", err);
            if let Some(detail) = err.downcast_ref::<Error>().and_then(Error::detail) {
                eprintln!("{}", detail);
            }
            ExitCode::FAILURE
        }
    }
}
