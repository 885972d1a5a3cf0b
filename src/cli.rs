use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "gemini-keypool",
    version,
    about = "Generate mock-exam content with Gemini, spreading load across a pool of API keys",
    long_about = "Runs content-generation jobs against the Gemini API using a pool of API keys. Each job gets a stable key, quota and auth failures fail over to healthy keys, and transient errors are retried with exponential backoff."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "GEMINI_KEYPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "GEMINI_KEYPOOL_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate mock tests from a prompt file, one job per test
    Generate {
        /// Prompt file sent for every job
        #[arg(short, long, value_name = "FILE")]
        prompt: PathBuf,

        /// Number of mock tests to generate
        #[arg(short = 'n', long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        count: u64,

        /// Number of the first mock test (job ids continue from here)
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
        start_at: u64,

        /// Output directory (overrides runner.output_dir)
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Load the key pool and show masked keys with their status
    Keys {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,

        /// Show detailed validation output
        #[arg(short, long)]
        verbose: bool,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
