use clap::{Parser, Subcommand};

/// Background job worker for the harvest queue.
#[derive(Parser)]
#[command(name = "harvest-worker")]
#[command(version)]
pub(crate) struct Cli {
    /// Config file (falls back to $HARVEST_CONFIG, then ~/.harvest/harvest.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Poll the queue and execute jobs until interrupted (default)
    Run,

    /// Add a pending job
    Enqueue {
        /// Job type tag, e.g. scrape
        #[arg(long = "type")]
        job_type: String,

        /// Target URL
        #[arg(long)]
        url: String,

        /// Higher runs first
        #[arg(long, default_value_t = harvest_jobs::types::DEFAULT_PRIORITY)]
        priority: i64,

        /// Executor parameters as a JSON document
        #[arg(long)]
        input: Option<String>,
    },

    /// Run one retention pass and print what was removed
    Cleanup,

    /// Print job counts per status
    Status,
}
