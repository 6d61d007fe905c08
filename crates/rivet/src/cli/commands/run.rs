//! Run command - execute tasks across the workspace

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use rivet_cache::SharedCache;
use rivet_tasks::{
    NodeState, RunSummary, Scheduler, SchedulerOptions, ShellRunner, TaskEvent, TaskGraph,
    TaskId, TaskReporter, TaskReporterRegistry, TracingReporter,
};

use crate::cli::context::WorkspaceContext;
use crate::cli::output::{self, plural};
use crate::cli::{Cli, OutputFormat};

/// Lines of captured output shown for a failed task
const FAILURE_TAIL_LINES: usize = 20;

/// Why `rivet run` did not succeed
#[derive(Debug, thiserror::Error)]
pub enum RunFailure {
    #[error("Failed tasks: {0}")]
    TasksFailed(usize),

    #[error("Run cancelled")]
    Cancelled,
}

/// Run tasks across the workspace
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Tasks to run (e.g., build test lint, or app#build)
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Only run in these packages; `name...` adds the packages depending on it
    #[arg(long)]
    pub filter: Vec<String>,

    /// Maximum concurrent tasks
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Show execution plan without running
    #[arg(long)]
    pub dry_run: bool,

    /// Continue running independent tasks when one fails
    #[arg(long)]
    pub continue_on_failure: bool,

    /// Disable task cache
    #[arg(long)]
    pub no_cache: bool,
}

impl RunCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let workspace = WorkspaceContext::load(&cwd)?;
        let selected = workspace.select(&self.filter)?;

        let graph = workspace
            .task_graph(&self.tasks, selected.as_ref())
            .context("Invalid task configuration")?;

        if graph.is_empty() {
            if cli.chatty() {
                output::success("No tasks to run.");
            }
            return Ok(());
        }

        if self.dry_run {
            return print_plan(cli, &graph);
        }

        if cli.chatty() {
            println!();
            output::info(&format!(
                "{} across {}",
                plural(graph.len(), "task"),
                plural(package_count(&graph), "package")
            ));
            if cli.verbose {
                println!();
                println!("{}", graph.execution_plan());
            }
            println!();
        }

        let settings = &workspace.config;
        let use_cache = settings.cache.enabled && !self.no_cache;
        let cache = use_cache.then(|| workspace.cache());
        if let Some(cache) = &cache {
            if let Err(e) = cache.initialize().await {
                warn!(error = %e, "cache unavailable, running without it");
            }
        }

        let mut registry = TaskReporterRegistry::empty();
        registry.register(TracingReporter);
        if cli.chatty() {
            registry.register(ConsoleReporter::new(&graph, cli.verbose));
        }

        let options = SchedulerOptions {
            concurrency: self.concurrency.unwrap_or(settings.tasks.concurrency),
            cpu_workers: settings.tasks.cpu_workers,
            continue_on_failure: self.continue_on_failure || settings.tasks.continue_on_failure,
            use_cache,
            root_dir: workspace.root.clone(),
            global: workspace.global_components(),
        };
        let runner = Arc::new(ShellRunner::new(settings.tasks.kill_on_failure));
        let scheduler = Scheduler::new(options, cache.clone(), runner, Arc::new(registry));

        let cancel = scheduler.cancel_handle();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let summary = scheduler.execute(&graph).await;
        interrupt.abort();

        if let Some(cache) = &cache {
            finish_cache(&workspace, cache).await;
        }

        match cli.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&summary_json(&summary))?)
            }
            OutputFormat::Text if !cli.quiet => print_failures(&summary),
            OutputFormat::Text => {}
        }

        if summary.cancelled {
            return Err(RunFailure::Cancelled.into());
        }
        let failed = summary.failed();
        if failed > 0 {
            return Err(RunFailure::TasksFailed(failed).into());
        }
        Ok(())
    }
}

fn package_count(graph: &TaskGraph) -> usize {
    graph
        .nodes()
        .keys()
        .map(|id| id.package.as_str())
        .collect::<BTreeSet<_>>()
        .len()
}

/// Flush the cache and apply the configured budgets
async fn finish_cache(workspace: &WorkspaceContext, cache: &SharedCache) {
    let settings = &workspace.config.cache;
    if settings.max_size_mb.is_some() || settings.max_age_days.is_some() {
        match cache
            .prune_cache(settings.max_size_mb, settings.max_age_days)
            .await
        {
            Ok(removed) if removed > 0 => {
                tracing::info!(removed, "pruned cache entries over budget");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cache pruning failed"),
        }
    }
    cache.shutdown().await;
}

fn print_plan(cli: &Cli, graph: &TaskGraph) -> anyhow::Result<()> {
    match cli.format {
        OutputFormat::Json => {
            let plan: Vec<serde_json::Value> = graph
                .levels()
                .iter()
                .enumerate()
                .map(|(i, level)| {
                    serde_json::json!({
                        "level": i,
                        "tasks": level.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        OutputFormat::Text => {
            println!("{}", graph.execution_plan());
            println!(
                "{}",
                style("[DRY RUN - no tasks will be executed]").yellow().bold()
            );
        }
    }
    Ok(())
}

fn summary_json(summary: &RunSummary) -> serde_json::Value {
    serde_json::json!({
        "total": summary.total(),
        "succeeded": summary.succeeded(),
        "cached": summary.cached(),
        "failed": summary.failed(),
        "aborted": summary.aborted(),
        "cancelled": summary.cancelled,
        "duration_ms": summary.duration.as_millis() as u64,
        "tasks": summary.outcomes.iter().map(|o| {
            serde_json::json!({
                "id": o.id.to_string(),
                "state": o.state,
                "duration_ms": o.duration.as_millis() as u64,
                "exit_code": o.exit_code,
                "cache_key": o.cache_key.as_ref().map(|k| k.to_string()),
                "aborted_by": o.aborted_by.as_ref().map(|id| id.to_string()),
                "not_cached": o.store_failure.as_ref().map(|f| f.to_string()),
                "reason": o.reason,
            })
        }).collect::<Vec<_>>(),
    })
}

/// Captured output of each failed task and the tasks it took down with it
fn print_failures(summary: &RunSummary) {
    let failures: Vec<_> = summary.failures().collect();
    if failures.is_empty() {
        return;
    }

    println!();
    println!(
        "  {} {}/{} tasks failed:",
        style("✗").red().bold(),
        failures.len(),
        summary.total()
    );

    for failure in failures {
        println!();
        println!(
            "  {} {} {}",
            style("✗").red(),
            output::task_style().apply_to(&failure.id),
            style(failure.reason.as_deref().unwrap_or("failed")).dim()
        );

        let captured = if failure.stderr.trim().is_empty() {
            &failure.stdout
        } else {
            &failure.stderr
        };
        let lines: Vec<&str> = captured.lines().collect();
        let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
        for line in &lines[start..] {
            println!("    {}", style(line).dim());
        }

        let aborted: Vec<String> = summary
            .outcomes
            .iter()
            .filter(|o| o.aborted_by.as_ref() == Some(&failure.id))
            .map(|o| o.id.to_string())
            .collect();
        if !aborted.is_empty() {
            println!(
                "    {} {}",
                style("aborted:").yellow(),
                aborted.join(", ")
            );
        }
    }
}

/// Console reporter with live output and a progress bar
struct ConsoleReporter {
    verbose: bool,
    commands: BTreeMap<TaskId, String>,
    progress: ProgressBar,
}

impl ConsoleReporter {
    fn new(graph: &TaskGraph, verbose: bool) -> Self {
        let progress = if console::Term::stdout().is_term() {
            ProgressBar::new(graph.len() as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(progress_style) =
            ProgressStyle::default_bar().template("  {bar:30.cyan/blue} {pos}/{len} {msg}")
        {
            progress.set_style(progress_style.progress_chars("=> "));
        }

        let commands = graph
            .nodes()
            .iter()
            .filter_map(|(id, node)| node.command().map(|c| (id.clone(), c.to_string())))
            .collect();

        Self {
            verbose,
            commands,
            progress,
        }
    }

    fn line(&self, text: String) {
        if self.progress.is_hidden() {
            println!("{}", text);
        } else {
            self.progress.println(text);
        }
    }

    fn elapsed(details: &rivet_tasks::TransitionDetails) -> String {
        let secs = details.elapsed.map(|d| d.as_secs_f64()).unwrap_or_default();
        style(format!("{:.1}s", secs)).dim().to_string()
    }
}

impl TaskReporter for ConsoleReporter {
    fn report(&self, event: &TaskEvent) {
        match event {
            TaskEvent::Transition { id, to, details, .. } => match to {
                NodeState::Running => {
                    let command = match (self.verbose, self.commands.get(id)) {
                        (true, Some(command)) => style(format!("({})", command)).dim().to_string(),
                        _ => String::new(),
                    };
                    self.line(format!("  {} {} {}", style("▸").dim(), style(id).bold(), command));
                }
                NodeState::Succeeded => self.line(format!(
                    "  {} {} {}",
                    style("✓").green(),
                    style(id).green(),
                    Self::elapsed(details)
                )),
                NodeState::Skipped => self.line(format!(
                    "  {} {} {} {}",
                    style("✓").green(),
                    style(id).green(),
                    style("(cached)").cyan(),
                    Self::elapsed(details)
                )),
                NodeState::Failed => self.line(format!(
                    "  {} {} {} {}",
                    style("✗").red(),
                    style(id).red(),
                    Self::elapsed(details),
                    style(details.reason.as_deref().unwrap_or_default()).red().dim()
                )),
                NodeState::Aborted => self.line(format!(
                    "  {} {} {}",
                    style("○").yellow(),
                    style(id).yellow(),
                    style(format!("({})", details.reason.as_deref().unwrap_or("aborted"))).dim()
                )),
                _ => {}
            },
            TaskEvent::Output {
                id,
                line,
                is_stderr,
                ..
            } => {
                if self.verbose {
                    let prefix = format!("[{}]", id);
                    let prefix = if *is_stderr {
                        style(prefix).red().dim()
                    } else {
                        style(prefix).dim()
                    };
                    self.line(format!("    {} {}", prefix, line));
                }
            }
            TaskEvent::Progress { completed, total } => {
                self.progress.set_length(*total as u64);
                self.progress.set_position(*completed as u64);
            }
            TaskEvent::AllCompleted {
                total,
                succeeded,
                cached,
                failed,
                aborted,
                duration,
            } => {
                self.progress.finish_and_clear();
                println!();
                println!(
                    "  {} {}/{} succeeded ({} cached), {} failed, {} aborted ({:.1}s)",
                    if *failed == 0 {
                        style("✓").green().bold()
                    } else {
                        style("✗").red().bold()
                    },
                    succeeded + cached,
                    total,
                    cached,
                    failed,
                    aborted,
                    duration.as_secs_f64()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_failure_message() {
        assert_eq!(RunFailure::TasksFailed(3).to_string(), "Failed tasks: 3");
        assert_eq!(RunFailure::Cancelled.to_string(), "Run cancelled");
    }

    #[test]
    fn test_summary_json_empty() {
        let summary = RunSummary {
            outcomes: Vec::new(),
            duration: std::time::Duration::from_millis(5),
            cancelled: false,
        };
        let json = summary_json(&summary);
        assert_eq!(json["total"], 0);
        assert_eq!(json["duration_ms"], 5);
        assert_eq!(json["cancelled"], false);
    }
}
