//! Command-line tools for workflow graph files

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use workflow_engine::composer::expand_subflows;
use workflow_engine::{
    extract, inline_wrapper, persist_pending, plan_graph, validate_workflow, EngineConfig,
    ExecutionPlan, StepMode, SubflowRepository, SubflowStore, WorkflowGraph,
};

#[derive(Parser)]
#[command(name = "workflow-cli", version, about = "Inspect, plan and compose workflow graphs")]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the execution plan of a graph
    Plan {
        graph: PathBuf,
        /// Directory of stored subflow definitions
        #[arg(long)]
        subflows: Option<PathBuf>,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a graph for errors
    Validate {
        graph: PathBuf,
        /// Directory of stored subflow definitions
        #[arg(long)]
        subflows: Option<PathBuf>,
    },
    /// Replace a selection of nodes with a subflow wrapper
    Extract {
        graph: PathBuf,
        /// Comma-separated node IDs
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,
        /// Title of the new subflow
        #[arg(long)]
        title: String,
        /// Store the definition in this directory instead of the wrapper
        #[arg(long)]
        subflows: Option<PathBuf>,
        /// Write the graph here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Splice a subflow wrapper's inner graph back into the graph
    Inline {
        graph: PathBuf,
        /// Wrapper node ID
        #[arg(long)]
        node: String,
        /// Directory of stored subflow definitions
        #[arg(long)]
        subflows: Option<PathBuf>,
        /// Write the graph here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the canonical snapshot of a graph
    Snapshot { graph: PathBuf },
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let output = match cli.command {
        Commands::Plan {
            graph,
            subflows,
            json,
        } => plan(&graph, subflows.as_deref(), json, &config)?,
        Commands::Validate { graph, subflows } => validate(&graph, subflows.as_deref())?,
        Commands::Extract {
            graph,
            nodes,
            title,
            subflows,
            out,
        } => extract_selection(&graph, &nodes, &title, subflows.as_deref(), out.as_deref())?,
        Commands::Inline {
            graph,
            node,
            subflows,
            out,
        } => inline_node(&graph, &node, subflows.as_deref(), out.as_deref())?,
        Commands::Snapshot { graph } => snapshot(&graph)?,
    };
    println!("{}", output);
    Ok(())
}

fn load_graph(path: &Path) -> anyhow::Result<WorkflowGraph> {
    WorkflowGraph::load(path).with_context(|| format!("Failed to read graph {}", path.display()))
}

fn load_store(dir: Option<&Path>) -> anyhow::Result<SubflowStore> {
    let Some(dir) = dir else {
        return Ok(SubflowStore::new());
    };
    let mut store = SubflowStore::with_persistence(dir);
    let loaded = store
        .load_from_disk()
        .with_context(|| format!("Failed to load subflows from {}", dir.display()))?;
    log::debug!("Loaded {} subflow definition(s)", loaded);
    Ok(store)
}

/// Write a graph to `out`, or return it for stdout
fn emit_graph(graph: &WorkflowGraph, out: Option<&Path>) -> anyhow::Result<String> {
    match out {
        Some(path) => {
            graph
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(format!("Wrote {}", path.display()))
        }
        None => Ok(graph.to_json_pretty()?),
    }
}

fn plan(
    path: &Path,
    subflows: Option<&Path>,
    json: bool,
    config: &EngineConfig,
) -> anyhow::Result<String> {
    let graph = load_graph(path)?;
    let store = load_store(subflows)?;
    let expansion = expand_subflows(&graph, Some(&store), config.max_subflow_depth)?;
    let plan = plan_graph(&expansion.graph)?;

    if json {
        return Ok(serde_json::to_string_pretty(&plan)?);
    }
    Ok(render_plan(&expansion.graph, &plan))
}

fn render_plan(graph: &WorkflowGraph, plan: &ExecutionPlan) -> String {
    let mut lines = Vec::new();
    for (index, step) in plan.steps.iter().enumerate() {
        let mut label = plan.step_label(index).unwrap_or_default();
        if let Some(loop_id) = &step.loop_id {
            label.push_str(&format!(" [loop {}]", loop_id));
        }
        if step.mode == StepMode::Sequential {
            label.push_str(" (sequential)");
        }
        lines.push(label);

        for node_id in &step.nodes {
            let title = graph
                .find_node(node_id)
                .map(|n| n.title())
                .unwrap_or_else(|| node_id.clone());
            match plan.branch_suffix(node_id) {
                Some(suffix) => lines.push(format!("  - {} {}", title, suffix)),
                None => lines.push(format!("  - {}", title)),
            }
        }
    }
    if !plan.inactive.is_empty() {
        let inactive: Vec<&str> = plan.inactive.iter().map(String::as_str).collect();
        lines.push(format!("Inactive: {}", inactive.join(", ")));
    }
    lines.join("\n")
}

fn validate(path: &Path, subflows: Option<&Path>) -> anyhow::Result<String> {
    let graph = load_graph(path)?;
    let store = load_store(subflows)?;
    let errors = validate_workflow(&graph, Some(&store));
    if errors.is_empty() {
        return Ok(format!("{}: ok", path.display()));
    }
    for error in &errors {
        eprintln!("{}", error);
    }
    bail!("{} validation error(s) in {}", errors.len(), path.display())
}

fn extract_selection(
    path: &Path,
    nodes: &[String],
    title: &str,
    subflows: Option<&Path>,
    out: Option<&Path>,
) -> anyhow::Result<String> {
    let mut graph = load_graph(path)?;
    let extraction = extract(&mut graph, nodes, title)?;
    log::info!(
        "Extracted {} node(s) into '{}'",
        nodes.len(),
        extraction.wrapper_id
    );

    if subflows.is_some() {
        let mut store = load_store(subflows)?;
        let id = persist_pending(&mut graph, &extraction.wrapper_id, &mut store)?;
        log::info!("Stored subflow '{}'", id);
    }
    emit_graph(&graph, out)
}

fn inline_node(
    path: &Path,
    node: &str,
    subflows: Option<&Path>,
    out: Option<&Path>,
) -> anyhow::Result<String> {
    let mut graph = load_graph(path)?;
    let store = load_store(subflows)?;
    let repository: &dyn SubflowRepository = &store;
    let inlined = inline_wrapper(&mut graph, node, Some(repository))?;
    log::info!("Inlined {} node(s) from '{}'", inlined.node_ids.len(), node);
    emit_graph(&graph, out)
}

fn snapshot(path: &Path) -> anyhow::Result<String> {
    let graph = load_graph(path)?;
    Ok(String::from_utf8(graph.snapshot()?)?)
}
