//! CLI binary for running and resuming BSJ content pipeline runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use bsj_llm::GeminiAdapter;
use bsj_pipeline::{
    bsj, checkpoint, render, AutoApprove, ConsoleReviewer, EventEmitter, Orchestrator,
    PipelineConfig, PipelineEvent, PipelineRun, ReviewChannel, ReviewDecision, ReviewRequest,
    RunPhase, RunReport, RunStatus, RunStep, Step,
};
use bsj_tools::{FetchUrlTool, SpeechTool, ToolRegistry, WebSearchTool};

#[derive(Parser)]
#[command(name = "bsj", version, about = "Multi-agent content pipeline with human review gates")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new run for a topic
    Run {
        /// Topic to research and write about
        #[arg(short, long)]
        topic: String,

        /// Approve every review gate without asking
        #[arg(long)]
        auto_approve: bool,

        /// Pipeline config file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Directory holding the saved run (default: .bsj)
        #[arg(long, default_value = ".bsj")]
        state_dir: PathBuf,

        /// Stop at the first review gate; continue later with `bsj resume`
        #[arg(long, conflicts_with = "auto_approve")]
        detach: bool,

        /// Also produce a newsletter issue
        #[arg(long)]
        newsletter: bool,

        /// Write the rendered artifacts to this Markdown file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Continue a saved run, optionally answering its pending review
    Resume {
        /// Directory holding the saved run (default: .bsj)
        #[arg(long, default_value = ".bsj")]
        state_dir: PathBuf,

        /// Pipeline config file (JSON); must match the one the run started with
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Approve the pending review
        #[arg(long, conflicts_with = "reject")]
        approve: bool,

        /// Reject the pending review
        #[arg(long)]
        reject: bool,

        /// Reviewer notes passed to the decision
        #[arg(long)]
        notes: Option<String>,

        /// Stop again at the next review gate instead of prompting
        #[arg(long)]
        detach: bool,

        /// Topology includes the newsletter stage
        #[arg(long)]
        newsletter: bool,

        /// Write the rendered artifacts to this Markdown file
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// List the stages of the BSJ topology
    Stages {
        /// Pipeline config file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Include the newsletter stage
        #[arg(long)]
        newsletter: bool,
    },

    /// Print the artifacts of a saved run
    Render {
        /// Directory holding the saved run (default: .bsj)
        #[arg(long, default_value = ".bsj")]
        state_dir: PathBuf,

        /// Print flat `key.path = value` lines instead of Markdown
        #[arg(long, conflicts_with = "json")]
        flat: bool,

        /// Print the raw session state as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let default_filter = if cli.verbose { "bsj=debug" } else { "bsj=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    load_dotenv();

    let exit_code = match cli.command {
        Commands::Run {
            topic,
            auto_approve,
            config,
            state_dir,
            detach,
            newsletter,
            out,
        } => {
            let config = load_config(config.as_deref(), newsletter).await?;
            let options = DriveOptions {
                auto_approve,
                detach,
                out,
            };
            cmd_run(&topic, &config, &state_dir, &options).await?
        }
        Commands::Resume {
            state_dir,
            config,
            approve,
            reject,
            notes,
            detach,
            newsletter,
            out,
        } => {
            let config = load_config(config.as_deref(), newsletter).await?;
            let decision = match (approve, reject) {
                (true, _) => Some(ReviewDecision::approve_with_notes(notes.unwrap_or_default())),
                (_, true) => Some(ReviewDecision::reject(notes.unwrap_or_default())),
                _ => None,
            };
            let options = DriveOptions {
                auto_approve: false,
                detach,
                out,
            };
            cmd_resume(&config, &state_dir, decision, &options).await?
        }
        Commands::Stages { config, newsletter } => {
            let config = load_config(config.as_deref(), newsletter).await?;
            cmd_stages(&config)?;
            0
        }
        Commands::Render {
            state_dir,
            flat,
            json,
        } => {
            cmd_render(&state_dir, flat, json).await?;
            0
        }
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// `.env` from `BSJ_DOTENV` if set, else the nearest `.env` upwards.
fn load_dotenv() {
    let loaded = match std::env::var("BSJ_DOTENV") {
        Ok(path) => dotenvy::from_path(&path).map(|_| PathBuf::from(path)),
        Err(_) => dotenvy::dotenv(),
    };
    match loaded {
        Ok(path) => tracing::debug!(path = %path.display(), "Loaded environment file"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(error = %e, "Could not read environment file"),
    }
}

async fn load_config(path: Option<&Path>, newsletter: bool) -> anyhow::Result<PipelineConfig> {
    let mut config = match path {
        Some(p) => PipelineConfig::load(p).await?,
        None => PipelineConfig::default(),
    };
    config.include_newsletter |= newsletter;
    Ok(config)
}

/// Register every tool whose credentials are present. Missing ones are left
/// out and resolved as degraded at run start.
fn register_tools(audio_dir: PathBuf) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    if let Some(tool) = WebSearchTool::from_env() {
        tools.register(tool);
    }
    if let Some(tool) = FetchUrlTool::from_env() {
        tools.register(tool);
    }
    if let Some(tool) = SpeechTool::from_env(audio_dir) {
        tools.register(tool);
    }
    tracing::debug!(tools = ?tools.names(), "Tools registered");
    tools
}

fn build_orchestrator(config: &PipelineConfig, state_dir: &Path) -> anyhow::Result<Orchestrator> {
    let provider = Arc::new(GeminiAdapter::from_env()?);
    let audio_dir = config
        .audio_dir
        .clone()
        .unwrap_or_else(|| state_dir.join("audio"));
    let topology = bsj::topology(config)?;
    let orchestrator = Orchestrator::new(topology, provider, register_tools(audio_dir), config)?
        .with_checkpoint_dir(state_dir);
    Ok(orchestrator)
}

// ---------------------------------------------------------------------------
// run / resume
// ---------------------------------------------------------------------------

struct DriveOptions {
    auto_approve: bool,
    detach: bool,
    out: Option<PathBuf>,
}

async fn cmd_run(
    topic: &str,
    config: &PipelineConfig,
    state_dir: &Path,
    options: &DriveOptions,
) -> anyhow::Result<i32> {
    let orchestrator = build_orchestrator(config, state_dir)?;
    checkpoint::clear_run(state_dir).await?;
    let mut run = orchestrator.start(topic)?;

    println!("Topic: {}", run.topic);
    println!("Run: {}", run.id);
    println!("State: {}", state_dir.display());

    continue_run(&orchestrator, &mut run, state_dir, options).await
}

async fn cmd_resume(
    config: &PipelineConfig,
    state_dir: &Path,
    decision: Option<ReviewDecision>,
    options: &DriveOptions,
) -> anyhow::Result<i32> {
    let Some(mut run) = checkpoint::load_run(state_dir).await? else {
        anyhow::bail!("No saved run in {}", state_dir.display());
    };
    let orchestrator = build_orchestrator(config, state_dir)?;
    if run.topology != orchestrator.topology().name {
        anyhow::bail!(
            "Saved run uses topology '{}', not '{}'",
            run.topology,
            orchestrator.topology().name
        );
    }

    println!("Resuming run {} ({})", run.id, run.topic);
    if let Some(decision) = decision {
        match run.phase.clone() {
            RunPhase::AwaitingReview { gate } => {
                println!(
                    "{}: {}",
                    gate,
                    if decision.approved { "approved" } else { "rejected" }
                );
                orchestrator.resolve(&mut run, decision).await?;
            }
            RunPhase::Finished { .. } => anyhow::bail!("Run {} has already finished", run.id),
            RunPhase::Running => anyhow::bail!("Run {} is not waiting for a review", run.id),
        }
    }

    continue_run(&orchestrator, &mut run, state_dir, options).await
}

/// Drive `run` until it finishes, or until the next gate when detached.
/// Returns the process exit code.
async fn continue_run(
    orchestrator: &Orchestrator,
    run: &mut PipelineRun,
    state_dir: &Path,
    options: &DriveOptions,
) -> anyhow::Result<i32> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            trigger.cancel();
        }
    });
    let progress = spawn_progress(orchestrator.events());

    let report = if options.detach {
        match orchestrator.advance(run, &cancel).await? {
            RunStep::Suspended(request) => {
                progress.abort();
                print_pending(&request, state_dir);
                return Ok(0);
            }
            RunStep::Finished(report) => report,
        }
    } else {
        let reviewer: &dyn ReviewChannel = if options.auto_approve {
            &AutoApprove
        } else {
            &ConsoleReviewer
        };
        orchestrator.drive(run, reviewer, &cancel).await?
    };
    progress.abort();

    print_report(&report);
    let markdown = render::run_markdown(&report.state);
    match &options.out {
        Some(path) => {
            tokio::fs::write(path, &markdown).await?;
            println!("Artifacts written to {}", path.display());
        }
        None if report.status == Some(RunStatus::Completed) => println!("\n{markdown}"),
        None => {}
    }

    Ok(report.status.map(|s| s.exit_code()).unwrap_or(1))
}

fn spawn_progress(events: &EventEmitter) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(line) = progress_line(&event) {
                        eprintln!("{line}");
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn progress_line(event: &PipelineEvent) -> Option<String> {
    let line = match event {
        PipelineEvent::RunStarted {
            topic, stage_count, ..
        } => format!("> Started \"{topic}\" ({stage_count} stages)"),
        PipelineEvent::StageStarted { stage, attempt } => {
            format!("  {stage}: attempt {attempt}")
        }
        PipelineEvent::StageCompleted {
            stage, duration_ms, ..
        } => format!("  {stage}: done ({:.1}s)", *duration_ms as f64 / 1000.0),
        PipelineEvent::StageRetrying {
            stage,
            attempt,
            diagnostic,
        } => format!("  {stage}: attempt {attempt} rejected: {diagnostic}"),
        PipelineEvent::ToolFallback { stage, tool } => {
            format!("  {stage}: {tool} unavailable, answered without tools")
        }
        PipelineEvent::CapabilityDegraded { tool, reason } => {
            format!("  tool {tool} degraded: {reason}")
        }
        PipelineEvent::ReviewPending { gate, round, .. } => {
            format!("  {gate}: waiting for review (round {round})")
        }
        PipelineEvent::ReviewResolved { gate, approved } => format!(
            "  {gate}: {}",
            if *approved { "approved" } else { "rejected" }
        ),
        PipelineEvent::RunFinished {
            status,
            duration_ms,
            ..
        } => format!("> Finished: {status} ({:.1}s)", *duration_ms as f64 / 1000.0),
        PipelineEvent::StateMerged { .. } | PipelineEvent::CheckpointSaved { .. } => return None,
    };
    Some(line)
}

fn print_pending(request: &ReviewRequest, state_dir: &Path) {
    println!(
        "\n=== Review pending: {} (round {}) ===\n\n{}\n",
        request.gate,
        request.round,
        request.artifact_text()
    );
    println!("Run saved to {}", state_dir.display());
    println!("Continue with one of:");
    println!("  bsj resume --approve [--notes \"...\"]");
    println!("  bsj resume --reject --notes \"what to change\"");
}

fn print_report(report: &RunReport) {
    let status = report.status.map(|s| s.as_str()).unwrap_or("unfinished");
    println!("\nRun {}: {}", report.run_id, status);
    if let Some(reason) = &report.reason {
        println!("Reason: {reason}");
    }
    println!("Agent invocations: {}", report.attempts.len());
    let fallbacks = report.attempts.iter().filter(|a| a.tool_fallback).count();
    if fallbacks > 0 {
        println!("Invocations without tools: {fallbacks}");
    }
    if !report.degraded_tools.is_empty() {
        println!("Degraded tools: {}", report.degraded_tools.join(", "));
    }
}

// ---------------------------------------------------------------------------
// stages / render
// ---------------------------------------------------------------------------

fn cmd_stages(config: &PipelineConfig) -> anyhow::Result<()> {
    let topology = bsj::topology(config)?;
    topology.validate()?;

    println!("Topology: {}", topology.name);
    println!("Seeds: {}", topology.seeds.join(", "));
    for (index, step) in topology.steps.iter().enumerate() {
        let parallel = matches!(step, Step::Parallel(_));
        if parallel {
            println!("{:>2}. parallel", index + 1);
        }
        for stage in step.stages() {
            let prefix = if parallel {
                "      - ".to_string()
            } else {
                format!("{:>2}. ", index + 1)
            };
            let pad = " ".repeat(prefix.len() + 2);
            let kind = if stage.is_review_gate() { "gate" } else { "agent" };
            println!(
                "{prefix}{} [{kind}] {} -> {}",
                stage.name,
                stage.inputs.join(", "),
                stage.outputs.join(", ")
            );
            if !stage.description.is_empty() {
                println!("{pad}{}", stage.description);
            }
            let Some(spec) = stage.agent_spec() else {
                continue;
            };
            if let Some(model) = &spec.model {
                println!("{pad}model: {model}");
            }
            if !spec.capabilities.is_empty() {
                // optional tools carry a trailing '?'
                let tools: Vec<String> = spec
                    .capabilities
                    .iter()
                    .map(|c| if c.required { c.name.clone() } else { format!("{}?", c.name) })
                    .collect();
                println!("{pad}tools: {}", tools.join(", "));
            }
        }
    }
    Ok(())
}

async fn cmd_render(state_dir: &Path, flat: bool, json: bool) -> anyhow::Result<()> {
    let Some(run) = checkpoint::load_run(state_dir).await? else {
        anyhow::bail!("No saved run in {}", state_dir.display());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&run.state.to_json())?);
    } else if flat {
        for (path, value) in render::flatten_state(&run.state) {
            println!("{path} = {value}");
        }
    } else {
        println!("{}", render::run_markdown(&run.state));
    }
    Ok(())
}
