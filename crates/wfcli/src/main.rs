// crates/wfcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wfcaps::StaticTrigger;
use wfcore::{Capability, ExecutionEvent, StepDefinition, Value, ValueMap, WorkflowSpec};
use wfruntime::{
    CapabilityRegistry, DependencyGraph, NewWorkflowParams, ResultsTable, Runner, RuntimeConfig,
    WorkflowSpecFactory,
};

#[derive(Parser)]
#[command(name = "wf")]
#[command(about = "Workflow CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file against the standard capabilities
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger payload as a JSON object
        #[arg(short, long)]
        payload: Option<String>,

        /// Participants simulated for node-mode steps
        #[arg(long)]
        participants: Option<usize>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Compile a workflow file and check its dependency graph
    Validate {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,
    },

    /// List the standard capabilities
    Capabilities,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

/// On-disk form of a workflow: steps in declaration order
#[derive(Debug, Serialize, Deserialize)]
struct WorkflowFile {
    owner: String,
    name: String,
    steps: Vec<StepDefinition>,
}

impl WorkflowFile {
    fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: Self =
            serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;
        tracing::info!("Loaded workflow {} with {} step(s)", file.name, file.steps.len());
        Ok(file)
    }

    fn compile(self) -> Result<WorkflowSpec> {
        let name = self.name.clone();
        let mut factory = WorkflowSpecFactory::new(NewWorkflowParams::new(self.owner, self.name));
        for step in self.steps {
            factory.add_step(step);
        }
        factory.spec().map_err(|errors| {
            tracing::error!("Workflow {} failed to compile: {}", name, errors);
            errors.into()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let verbose = matches!(cli.command, Commands::Run { verbose: true, .. });
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Run {
            file,
            payload,
            participants,
            ..
        } => {
            run_workflow(file, payload, participants).await?;
        }

        Commands::Validate { file } => {
            validate_workflow(file).await?;
        }

        Commands::Capabilities => {
            list_capabilities().await?;
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

async fn standard_registry() -> Result<Arc<CapabilityRegistry>> {
    let registry = Arc::new(CapabilityRegistry::new());
    for capability in wfcaps::standard_capabilities() {
        registry.add(capability).await?;
    }
    Ok(registry)
}

fn parse_payload(payload: Option<String>) -> Result<ValueMap> {
    let Some(raw) = payload else {
        return Ok(ValueMap::new());
    };
    let json: serde_json::Value = serde_json::from_str(&raw).context("parsing --payload")?;
    match Value::from(json) {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("Payload must be a JSON object, got {}", other.kind()),
    }
}

async fn run_workflow(
    file: PathBuf,
    payload: Option<String>,
    participants: Option<usize>,
) -> Result<()> {
    println!("🚀 Loading workflow from: {}", file.display());

    let spec = WorkflowFile::load(&file)?.compile()?;
    println!("📋 Workflow: {} (owner {})", spec.name, spec.owner);
    println!("   Steps: {}", spec.step_count());
    println!();

    let registry = standard_registry().await?;
    let payload = parse_payload(payload)?;
    tracing::debug!("Trigger payload has {} field(s)", payload.len());
    registry
        .replace(Capability::trigger(Arc::new(StaticTrigger::new(payload))))
        .await?;

    let mut config = RuntimeConfig::default();
    if let Some(participants) = participants {
        config.participants = participants;
    }
    let runner = Runner::with_config(registry, config);

    // Subscribe to events for real-time output
    let mut events = runner.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutionEvent::WorkflowStarted { .. } => {
                    println!("▶️  Workflow started");
                }
                ExecutionEvent::StepStarted {
                    step_ref,
                    capability_id,
                    ..
                } => {
                    println!("  ⚡ Starting step: {} ({})", step_ref, capability_id);
                }
                ExecutionEvent::StepCompleted {
                    step_ref,
                    duration_ms,
                    ..
                } => {
                    println!("  ✅ Step {} completed in {}ms", step_ref, duration_ms);
                }
                ExecutionEvent::StepFailed { step_ref, error, .. } => {
                    println!("  ❌ Step {} failed: {}", step_ref, error);
                }
                ExecutionEvent::ConsensusCompleted {
                    step_ref,
                    policy,
                    reached,
                    ..
                } => {
                    let outcome = if reached { "reached" } else { "not reached" };
                    println!("     🤝 [{}] {} consensus {}", step_ref, policy, outcome);
                }
                ExecutionEvent::WorkflowCompleted {
                    success,
                    duration_ms,
                    ..
                } => {
                    if success {
                        println!("✨ Workflow completed successfully in {}ms", duration_ms);
                    } else {
                        println!("💥 Workflow failed after {}ms", duration_ms);
                    }
                }
            }
        }
    });

    let outcome = runner.run(&spec).await;

    // Dropping the runner closes the event stream
    drop(runner);
    let _ = event_task.await;

    match outcome {
        Ok(report) => {
            tracing::info!(
                "Execution {} completed {}/{} steps",
                report.execution_id,
                report.completed_steps,
                report.total_steps
            );
            println!();
            println!("📊 Execution Summary:");
            println!("   Execution ID: {}", report.execution_id);
            println!(
                "   Completed: {}/{} steps",
                report.completed_steps, report.total_steps
            );
            print_results(&report.results);
            Ok(())
        }
        Err(failure) => {
            tracing::error!("Workflow {} failed: {}", spec.name, failure.error);
            print_results(&failure.results);
            Err(failure.error.into())
        }
    }
}

fn print_results(results: &ResultsTable) {
    let mut refs: Vec<&str> = results.refs().collect();
    if refs.is_empty() {
        return;
    }
    refs.sort_unstable();

    println!();
    println!("📤 Outputs:");
    for step_ref in refs {
        for result in results.get_all(step_ref) {
            if result.outputs.is_empty() {
                continue;
            }
            println!("   Step {}:", step_ref);
            let mut keys: Vec<&String> = result.outputs.keys().collect();
            keys.sort();
            for key in keys {
                println!("     {}: {:?}", key, result.outputs[key]);
            }
        }
    }
}

async fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let spec = match WorkflowFile::load(&file)?.compile() {
        Ok(spec) => spec,
        Err(e) => {
            println!("❌ Workflow does not compile:");
            println!("   {}", e);
            return Err(e);
        }
    };
    let graph = DependencyGraph::build(&spec)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", spec.name);
    println!("   Steps: {}", spec.step_count());
    println!("   Order: {}", graph.execution_order().join(" → "));

    let registry = standard_registry().await?;
    for step in spec.steps() {
        if registry.get(&step.id).await.is_err() {
            tracing::warn!("Step {} uses unknown capability {}", step.step_ref, step.id);
            println!(
                "   ⚠️  {} uses {}, which is not a standard capability",
                step.step_ref, step.id
            );
        }
    }

    Ok(())
}

async fn list_capabilities() -> Result<()> {
    println!("📦 Standard Capabilities:");
    println!();

    let registry = standard_registry().await?;
    let mut capabilities = registry.list().await;
    capabilities.sort_by(|a, b| a.id.to_string().cmp(&b.id.to_string()));

    for info in capabilities {
        println!("  • {} ({})", info.id, info.capability_type);
        println!("    {}", info.description);
    }
    Ok(())
}

fn example_workflow() -> WorkflowFile {
    let trigger = StepDefinition::trigger("static-trigger@1.0.0", "trigger");
    let action = StepDefinition::action("passthrough@1.0.0", "greet")
        .with_input("message", "$(trigger.outputs.message)")
        .with_config("defaults", Value::Object(wfcore::value_map! { "greeting" => "hello" }));
    let target = StepDefinition::target("log-target@1.0.0", "log").with_inputs_from("$(greet.outputs)");

    WorkflowFile {
        owner: "0x0000000000000000000000000000000000000000".to_string(),
        name: "example".to_string(),
        steps: vec![trigger, action, target],
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let json = serde_json::to_string_pretty(&example_workflow())?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  wf run --file {} --payload '{{\"message\": \"hi\"}}'",
        output.display()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_workflow_round_trips_and_compiles() {
        let json = serde_json::to_string(&example_workflow()).unwrap();
        let file: WorkflowFile = serde_json::from_str(&json).unwrap();
        let spec = file.compile().unwrap();

        assert_eq!(spec.triggers.len(), 1);
        assert_eq!(spec.actions.len(), 1);
        assert_eq!(spec.targets.len(), 1);
        assert!(DependencyGraph::build(&spec).is_ok());
    }

    #[test]
    fn test_payload_must_be_an_object() {
        assert!(parse_payload(None).unwrap().is_empty());
        assert_eq!(
            parse_payload(Some(r#"{"message": "hi"}"#.to_string())).unwrap(),
            wfcore::value_map! { "message" => "hi" }
        );
        assert!(parse_payload(Some("[1, 2]".to_string())).is_err());
    }
}
