//! CLI definition and command handling

pub mod commands;
pub mod context;
pub mod output;

use clap::{Parser, Subcommand};

use commands::{CacheCommand, GraphCommand, RunCommand};

/// Rivet - monorepo task runner with a shared cache
#[derive(Debug, Parser)]
#[command(name = "rivet")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run tasks across the workspace
    Run(RunCommand),

    /// Show the task graph without running it
    Graph(GraphCommand),

    /// Manage the task cache
    Cache(CacheCommand),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> anyhow::Result<()> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match self.command {
            Commands::Run(ref cmd) => cmd.execute(&self),
            Commands::Graph(ref cmd) => cmd.execute(&self),
            Commands::Cache(ref cmd) => cmd.execute(&self),
        }
    }

    /// Whether human-readable output should be printed
    pub fn chatty(&self) -> bool {
        !self.quiet && self.format == OutputFormat::Text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from([
            "rivet",
            "run",
            "build",
            "test",
            "--filter",
            "app...",
            "--concurrency",
            "2",
            "--format",
            "json",
        ]);
        assert_eq!(cli.format, OutputFormat::Json);
        let Commands::Run(run) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(run.tasks, vec!["build", "test"]);
        assert_eq!(run.filter, vec!["app..."]);
        assert_eq!(run.concurrency, Some(2));
    }

    #[test]
    fn test_parse_cache_verify() {
        let cli = Cli::parse_from(["rivet", "-q", "cache", "verify", "--fix"]);
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Cache(_)));
    }
}
