mod runner;

use clap::Parser;

use crate::runner::{CliArgs, RunnerError};

fn main() {
    let args = CliArgs::parse();
    match runner::main(args) {
        Ok(()) => {}
        Err(e @ RunnerError::Startup(_)) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
        Err(e @ RunnerError::Runtime(_)) => {
            eprintln!("Error: {e}");
            std::process::exit(2);
        }
    }
}
