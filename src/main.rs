//! `tdbtool` — inspect and modify TDB database files.

mod cli;

use clap::Parser;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = cli::args::Cli::parse();
    if let Err(e) = cli::commands::run(args) {
        eprintln!("tdbtool: {e:#}");
        std::process::exit(1);
    }
}
