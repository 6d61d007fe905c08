//! Cache management command

use clap::{Args, Subcommand};
use console::style;

use rivet_cache::{SharedCache, VerifyReport};

use crate::cli::context::WorkspaceContext;
use crate::cli::output;
use crate::cli::{Cli, OutputFormat};

/// Task cache management
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show cache statistics
    Stats(CacheStatsCommand),
    /// Evict least recently used entries until the cache is within budget
    Prune(CachePruneCommand),
    /// Check every entry against its manifest
    Verify(CacheVerifyCommand),
    /// Remove all cached entries
    Clean(CacheCleanCommand),
}

/// Show cache statistics
#[derive(Debug, Args)]
pub struct CacheStatsCommand;

/// Prune cache entries
#[derive(Debug, Args)]
pub struct CachePruneCommand {
    /// Size budget in megabytes (default: from config)
    #[arg(long)]
    pub max_size_mb: Option<u64>,

    /// Remove entries not used for this many days (default: from config)
    #[arg(long)]
    pub max_age_days: Option<u64>,
}

/// Verify cache integrity
#[derive(Debug, Args)]
pub struct CacheVerifyCommand {
    /// Delete corrupted entries
    #[arg(long)]
    pub fix: bool,
}

/// Remove all cached entries
#[derive(Debug, Args)]
pub struct CacheCleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let workspace = WorkspaceContext::load(&cwd)?;
        let cache = workspace.cache();

        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(async {
            let result = match &self.action {
                CacheAction::Stats(cmd) => cmd.execute(cli, &cache).await,
                CacheAction::Prune(cmd) => cmd.execute(cli, &workspace, &cache).await,
                CacheAction::Verify(cmd) => cmd.execute(cli, &cache).await,
                CacheAction::Clean(cmd) => cmd.execute(cli, &cache).await,
            };
            cache.shutdown().await;
            result
        })
    }
}

impl CacheStatsCommand {
    async fn execute(&self, cli: &Cli, cache: &SharedCache) -> anyhow::Result<()> {
        cache.initialize().await?;
        let stats = cache.statistics();

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "cache_dir": cache.root().display().to_string(),
                "hit_rate": stats.hit_rate(),
                "total_size_formatted": stats.formatted_size(),
                "statistics": stats,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!("{}", output::header("Task Cache Status"));
            println!();
            println!(
                "{}",
                output::key_value(
                    "Location",
                    &output::path_style().apply_to(cache.root().display()).to_string()
                )
            );
            for line in cache.display_statistics().lines().skip(1) {
                println!("  {}", line);
            }
        }

        Ok(())
    }
}

impl CachePruneCommand {
    async fn execute(
        &self,
        cli: &Cli,
        workspace: &WorkspaceContext,
        cache: &SharedCache,
    ) -> anyhow::Result<()> {
        let max_size_mb = self.max_size_mb.or(workspace.config.cache.max_size_mb);
        let max_age_days = self.max_age_days.or(workspace.config.cache.max_age_days);

        if max_size_mb.is_none() && max_age_days.is_none() {
            anyhow::bail!(
                "No pruning budget: pass --max-size-mb or --max-age-days, or set them under [cache]"
            );
        }

        if cli.chatty() {
            output::info("Pruning cache entries...");
        }

        let removed = cache.prune_cache(max_size_mb, max_age_days).await?;
        let stats = cache.statistics();

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "removed": removed,
                "remaining": stats.total_entries,
                "total_size": stats.total_size,
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!(
                "  {} Removed {} cache entries ({} kept, {})",
                style("✓").green(),
                removed,
                stats.total_entries,
                stats.formatted_size()
            );
        }

        Ok(())
    }
}

impl CacheVerifyCommand {
    async fn execute(&self, cli: &Cli, cache: &SharedCache) -> anyhow::Result<()> {
        let report = cache.verify_cache(self.fix).await?;

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else if !cli.quiet {
            print_report(&report, self.fix);
        }

        if report.corrupted > report.fixed {
            anyhow::bail!(
                "{} corrupted cache entries (run with --fix to remove them)",
                report.corrupted - report.fixed
            );
        }
        Ok(())
    }
}

fn print_report(report: &VerifyReport, fix: bool) {
    println!("{}", output::header("Cache Verification"));
    println!();
    println!("{}", output::key_value("Entries", &report.total.to_string()));
    println!("{}", output::key_value("Valid", &report.valid.to_string()));
    println!("{}", output::key_value("Corrupted", &report.corrupted.to_string()));
    if fix {
        println!("{}", output::key_value("Removed", &report.fixed.to_string()));
    }

    println!();
    if report.corrupted == 0 {
        output::success("Cache is consistent");
    } else if report.corrupted == report.fixed {
        output::success("Corrupted entries removed");
    } else {
        output::warning("Corrupted entries found");
    }
}

impl CacheCleanCommand {
    async fn execute(&self, cli: &Cli, cache: &SharedCache) -> anyhow::Result<()> {
        if !cache.root().exists() {
            if cli.chatty() {
                output::success("Cache directory does not exist.");
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!(
                    "Remove all cached entries at {}?",
                    cache.root().display()
                ))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        let removed = cache.clean_cache().await?;

        if cli.format == OutputFormat::Json {
            println!("{}", serde_json::json!({ "removed": removed }));
        } else if !cli.quiet {
            println!(
                "{} Removed {} cached entries at {}",
                style("✓").green(),
                removed,
                output::path_style().apply_to(cache.root().display())
            );
        }

        Ok(())
    }
}
