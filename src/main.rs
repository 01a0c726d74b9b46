// Headless entry point: every run is a batch of job files (or --status).

mod cli;

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    curveforge::logger::init();
    cli::run(cli::CliArgs::parse())
}
