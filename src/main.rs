use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use antigravity_usage::app;
use antigravity_usage::cli::{Cli, Commands};
use antigravity_usage::config::{self, TrackerSettings};
use antigravity_usage::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("antigravity-usage error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();

    let settings = TrackerSettings::load_or_init()?;
    let runtime = config::runtime_settings();

    match cli.command {
        Some(Commands::Status) => {
            app::print_status(&settings)?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&settings),
        Some(Commands::History { days }) => {
            app::print_history(&settings, days)?;
            Ok(0)
        }
        Some(Commands::Log) => {
            app::log_manual(&settings, &runtime)?;
            Ok(0)
        }
        Some(Commands::Reset { yes }) => app::reset(&settings, yes),
        Some(Commands::Prune) => {
            app::prune(&settings)?;
            Ok(0)
        }
        Some(Commands::Toggle) => {
            app::toggle()?;
            Ok(0)
        }
        None => {
            app::run(settings, runtime)?;
            Ok(0)
        }
    }
}
