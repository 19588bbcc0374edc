use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "snowwise",
    version,
    about = "Finds expensive Snowflake queries, proposes rewrites and proves them equivalent"
)]
pub struct Cli {
    /// Log output format on stderr
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the optimization workflow over the most expensive recent queries
    Run(RunArgs),
    /// Run the optimization workflow over one query you supply
    Optimize(OptimizeArgs),
    /// Write a sample config and an offline fixture
    Init(InitArgs),
    /// Print the tables a query references
    Extract(ExtractArgs),
    Version,
}

#[derive(Parser, Clone)]
pub struct RunArgs {
    #[arg(long, default_value = "snowwise.yaml")]
    pub config: PathBuf,

    /// Free-form request recorded on the run
    #[arg(long, default_value = "Find and optimize my most expensive queries")]
    pub request: String,

    /// Look back this many days (overrides settings.lookback_days)
    #[arg(long)]
    pub days: Option<u32>,

    /// execution_time | bytes_scanned (overrides settings.expense_metric)
    #[arg(long)]
    pub metric: Option<String>,

    /// Proceed through every stage without asking
    #[arg(long)]
    pub yes: bool,

    /// Write the final report as JSON
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Reject unknown config fields
    #[arg(long)]
    pub strict: bool,

    /// Show tables, issues and rationale per candidate
    #[arg(long, short)]
    pub verbose: bool,
}

#[derive(Parser, Clone)]
pub struct OptimizeArgs {
    /// SQL text of a read-only query
    pub sql: String,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Parser, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "snowwise.yaml")]
    pub config: PathBuf,

    /// Also write the offline fixture the sample config points at
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub fixture: bool,
}

#[derive(Parser, Clone)]
pub struct ExtractArgs {
    /// SQL text
    pub sql: String,
}
