//! Graph command - show the task graph without running it

use clap::Args;
use console::style;

use crate::cli::context::WorkspaceContext;
use crate::cli::output;
use crate::cli::{Cli, OutputFormat};

/// Show the task graph for the given tasks
#[derive(Debug, Args)]
pub struct GraphCommand {
    /// Tasks to plan (e.g., build test, or app#build)
    #[arg(required = true)]
    pub tasks: Vec<String>,

    /// Only plan for these packages; `name...` adds the packages depending on it
    #[arg(long)]
    pub filter: Vec<String>,
}

impl GraphCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<()> {
        let cwd = std::env::current_dir()?;
        let workspace = WorkspaceContext::load(&cwd)?;
        let selected = workspace.select(&self.filter)?;
        let graph = workspace.task_graph(&self.tasks, selected.as_ref())?;

        if cli.format == OutputFormat::Json {
            let nodes: Vec<serde_json::Value> = graph
                .sorted()
                .iter()
                .filter_map(|id| graph.get(id))
                .map(|node| {
                    serde_json::json!({
                        "id": node.id.to_string(),
                        "command": node.command(),
                        "level": node.level,
                        "priority": node.priority,
                        "cpu_heavy": node.definition.cpu_heavy,
                        "cache": node.definition.cache,
                        "dependencies": node.dependencies.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&nodes)?);
            return Ok(());
        }

        if cli.quiet {
            return Ok(());
        }

        if graph.is_empty() {
            output::info("No tasks match.");
            return Ok(());
        }

        println!("{}", output::header("Execution plan"));
        println!();
        for line in graph.execution_plan().lines() {
            if line.starts_with("Level") {
                println!("{}", style(line).cyan());
            } else {
                println!("{}", line);
            }
        }
        Ok(())
    }
}
