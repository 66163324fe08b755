use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "antigravity-usage",
    version,
    about = "Track Antigravity agent requests and estimate rate-limit headroom"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a one-shot usage summary from stored history.
    Status,
    /// Check log discovery, data paths, and settings.
    Doctor,
    /// Show per-day request totals.
    History {
        /// Number of most recent days to show.
        #[arg(long, default_value_t = 14)]
        days: usize,
    },
    /// Record one request by hand.
    Log,
    /// Delete all stored usage history.
    Reset {
        /// Skip the confirmation guard.
        #[arg(long)]
        yes: bool,
    },
    /// Fold events older than a week into daily summaries.
    Prune,
    /// Enable or disable tracking.
    Toggle,
}
