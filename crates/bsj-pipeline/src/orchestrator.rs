//! Pipeline Orchestrator: walks a [`Topology`] for one topic.
//!
//! The orchestrator is a resumable state machine over a [`PipelineRun`].
//! [`Orchestrator::advance`] executes steps until the run either finishes or
//! reaches a review gate, where it suspends and returns the
//! [`ReviewRequest`]. [`Orchestrator::resolve`] folds a decision into the run,
//! after which `advance` can be called again (possibly by another process,
//! after a checkpoint round trip). [`Orchestrator::drive`] glues the two
//! together around a [`ReviewChannel`] for in-process use.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AgentStageAdapter, AttemptContext, StageAttempt};
use crate::capability::{self, ResolvedCapabilities, StageCapabilities};
use crate::checkpoint;
use crate::config::PipelineConfig;
use crate::events::{EventEmitter, PipelineEvent};
use crate::render;
use crate::retry::{self, RejectionPolicy, RetryPolicy};
use crate::review::{GateState, ReviewChannel, ReviewGate, ReviewRequest};
use crate::run::{PipelineRun, RunPhase, RunReport, RunStep};
use crate::schema::{OutputSchema, Shape};
use crate::stage::{StageDescriptor, Step, Topology};
use crate::validator::{ValidationResult, Validator};
use bsj_llm::ModelProvider;
use bsj_tools::ToolRegistry;
use bsj_types::{
    AttemptMetadata, AttemptOutcome, BsjError, MergePolicy, Result, ReviewDecision, RunStatus,
    StateView,
};

/// Output of one stage execution: the fragment to merge (or the error that
/// ended it) plus every attempt made along the way.
type StageExecution = (Result<BTreeMap<String, Value>>, Vec<AttemptMetadata>);

pub struct Orchestrator {
    topology: Topology,
    adapter: AgentStageAdapter,
    tools: ToolRegistry,
    retry: RetryPolicy,
    validator: Validator,
    merge_policy: MergePolicy,
    events: EventEmitter,
    checkpoint_dir: Option<PathBuf>,
}

/// Terminal status for errors that end a run normally. `None` means the
/// error is unexpected and propagates to the caller.
fn terminal_status(err: &BsjError) -> Option<RunStatus> {
    match err {
        e if e.is_recoverable() => Some(RunStatus::ValidationFailed),
        BsjError::ProviderUnavailable { .. } => Some(RunStatus::ProviderError),
        BsjError::Cancelled => Some(RunStatus::Cancelled),
        BsjError::RejectedByReviewer { .. } => Some(RunStatus::Rejected),
        _ => None,
    }
}

/// Which sibling failure ends a parallel step: fatal errors first, then
/// cancellation, then anything else. Ties keep declared order.
fn parallel_error_rank(err: &BsjError) -> u8 {
    match err {
        e if e.is_fatal() => 0,
        BsjError::Cancelled => 1,
        _ => 2,
    }
}

fn diagnostic_of(err: &BsjError) -> String {
    match err {
        BsjError::MalformedResponse { diagnostic, .. } => diagnostic.clone(),
        BsjError::EmptyResponse { .. } => "response was empty".to_string(),
        other => other.to_string(),
    }
}

impl Orchestrator {
    /// Build an orchestrator. Every wiring problem (bad topology, missing
    /// required tool, bad config) is reported here, before any run starts.
    pub fn new(
        topology: Topology,
        provider: Arc<dyn ModelProvider>,
        tools: ToolRegistry,
        config: &PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        topology.validate()?;
        capability::check_registered(&topology, &tools)?;

        let adapter = AgentStageAdapter::new(provider)
            .with_default_model(config.default_model.clone())
            .with_max_tool_rounds(config.max_tool_rounds);
        Ok(Self {
            topology,
            adapter,
            tools,
            retry: config.retry_policy(),
            validator: Validator::new(config.unknown_keys),
            merge_policy: config.merge_policy,
            events: EventEmitter::default(),
            checkpoint_dir: None,
        })
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Persist the run into `dir` after every step.
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// A fresh run for `topic`, with the topic seeded into state.
    pub fn start(&self, topic: &str) -> Result<PipelineRun> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(BsjError::ConfigurationError("topic must not be empty".into()));
        }
        Ok(PipelineRun::new(self.topology.name.clone(), topic))
    }

    /// Start a run and drive it to completion through `reviewer`.
    pub async fn run(
        &self,
        topic: &str,
        reviewer: &dyn ReviewChannel,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let mut run = self.start(topic)?;
        self.drive(&mut run, reviewer, cancel).await
    }

    /// Alternate `advance` and `resolve` until the run finishes. Waiting on
    /// the reviewer is cancellable.
    pub async fn drive(
        &self,
        run: &mut PipelineRun,
        reviewer: &dyn ReviewChannel,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        loop {
            let request = match self.advance(run, cancel).await? {
                RunStep::Finished(report) => return Ok(report),
                RunStep::Suspended(request) => request,
            };
            let decision = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(BsjError::Cancelled),
                decision = reviewer.decide(&request) => decision,
            };
            match decision {
                Ok(decision) => self.resolve(run, decision).await?,
                Err(BsjError::Cancelled) => {
                    tracing::info!(gate = %request.gate, "Cancelled while awaiting review");
                    return self.finish(run, RunStatus::Cancelled, None).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Execute steps until the run suspends at a gate or finishes.
    ///
    /// Calling this on a suspended run returns the same request again; on a
    /// finished run it returns the final report.
    pub async fn advance(&self, run: &mut PipelineRun, cancel: &CancellationToken) -> Result<RunStep> {
        match &run.phase {
            RunPhase::Finished { .. } => return Ok(RunStep::Finished(run.report())),
            RunPhase::AwaitingReview { gate } => {
                let gate = gate.clone();
                return Ok(RunStep::Suspended(self.pending_request(run, &gate)?));
            }
            RunPhase::Running => {}
        }

        if run.cursor == 0 && run.attempts.is_empty() {
            tracing::info!(run_id = %run.id, topic = %run.topic, "Run started");
            self.events.emit(PipelineEvent::RunStarted {
                run_id: run.id.clone(),
                topic: run.topic.clone(),
                stage_count: self.topology.stages().count(),
            });
        }

        let capabilities = match self.capabilities_for(run).await {
            Ok(caps) => caps,
            Err(e) => return self.abort(run, e).await,
        };

        while let Some(step) = self.topology.steps.get(run.cursor) {
            if cancel.is_cancelled() {
                return self.abort(run, BsjError::Cancelled).await;
            }
            let outcome = match step {
                Step::Single(stage) if stage.is_review_gate() => {
                    return self.suspend(run, stage).await;
                }
                Step::Single(stage) => self.execute_single(run, stage, &capabilities, cancel).await,
                Step::Parallel(stages) => {
                    self.execute_parallel(run, stages, &capabilities, cancel)
                        .await
                }
            };
            if let Err(e) = outcome {
                return self.abort(run, e).await;
            }
            run.cursor += 1;
            run.touch();
            self.checkpoint(run).await?;
        }

        let report = self.finish(run, RunStatus::Completed, None).await?;
        Ok(RunStep::Finished(report))
    }

    /// Apply a review decision to the gate `run` is waiting on.
    pub async fn resolve(&self, run: &mut PipelineRun, decision: ReviewDecision) -> Result<()> {
        let gate_name = run
            .pending_gate()
            .ok_or_else(|| BsjError::InvariantViolation("run is not awaiting review".into()))?
            .to_string();
        let stage = self.gate_stage(&gate_name)?;
        let gate = ReviewGate::for_stage(stage)?;
        let round = run.rejections.get(&gate_name).copied().unwrap_or(0) + 1;

        let outcome = gate.resolve(&mut run.state, &decision, round)?;
        self.events.emit(PipelineEvent::ReviewResolved {
            gate: gate_name.clone(),
            approved: decision.approved,
        });

        if outcome == GateState::Approved {
            run.cursor += 1;
            run.phase = RunPhase::Running;
            run.touch();
            return self.checkpoint(run).await;
        }

        let rejections = {
            let count = run.rejections.entry(gate_name.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let budget_left =
            self.retry.on_rejection == RejectionPolicy::Rerun && rejections < self.retry.max_attempts;
        if !budget_left {
            let err = BsjError::RejectedByReviewer {
                gate: gate_name,
                notes: decision.notes,
            };
            self.finish(run, RunStatus::Rejected, Some(err.to_string()))
                .await?;
            return Ok(());
        }

        let reviewed = self.topology.stage(gate.reviews()).ok_or_else(|| {
            BsjError::InvariantViolation(format!("gate '{gate_name}' reviews an unknown stage"))
        })?;
        let step = self.topology.step_index(&reviewed.name).ok_or_else(|| {
            BsjError::InvariantViolation(format!("stage '{}' is not in the topology", reviewed.name))
        })?;

        let note = if decision.notes.trim().is_empty() {
            "The reviewer rejected the previous version without notes; revise it.".to_string()
        } else {
            format!("Reviewer feedback on the previous version: {}", decision.notes.trim())
        };
        tracing::info!(
            gate = %gate_name,
            stage = %reviewed.name,
            rejections,
            "Rejected, re-running reviewed stage"
        );
        run.guidance
            .entry(reviewed.name.clone())
            .or_default()
            .push(note);
        run.state.thaw(&reviewed.outputs);
        run.cursor = step;
        run.phase = RunPhase::Running;
        run.touch();
        self.checkpoint(run).await
    }

    /// Probe tools on the first call for a run; afterwards rebuild the same
    /// attachment from the plan stored on the run.
    async fn capabilities_for(&self, run: &mut PipelineRun) -> Result<ResolvedCapabilities> {
        if let Some(plan) = &run.capabilities {
            return capability::restore(&self.topology, &self.tools, plan);
        }
        let capabilities = capability::resolve(&self.topology, &self.tools).await?;
        for (tool, reason) in &capabilities.degraded {
            if !run.degraded_tools.contains(tool) {
                run.degraded_tools.push(tool.clone());
            }
            self.events.emit(PipelineEvent::CapabilityDegraded {
                tool: tool.clone(),
                reason: reason.clone(),
            });
        }
        run.capabilities = Some(capabilities.plan());
        Ok(capabilities)
    }

    // -----------------------------------------------------------------------
    // Gates
    // -----------------------------------------------------------------------

    fn gate_stage(&self, name: &str) -> Result<&StageDescriptor> {
        self.topology
            .stage(name)
            .filter(|s| s.is_review_gate())
            .ok_or_else(|| BsjError::InvariantViolation(format!("unknown review gate '{name}'")))
    }

    fn pending_request(&self, run: &PipelineRun, gate_name: &str) -> Result<ReviewRequest> {
        let gate = ReviewGate::for_stage(self.gate_stage(gate_name)?)?;
        let round = run.rejections.get(gate_name).copied().unwrap_or(0) + 1;
        Ok(gate.request(&run.state, round))
    }

    async fn suspend(&self, run: &mut PipelineRun, stage: &StageDescriptor) -> Result<RunStep> {
        let gate = ReviewGate::for_stage(stage)?;
        let round = run.rejections.get(&stage.name).copied().unwrap_or(0) + 1;
        let request = gate.enter(&mut run.state, round)?;
        run.phase = RunPhase::AwaitingReview {
            gate: stage.name.clone(),
        };
        run.touch();
        self.events.emit(PipelineEvent::ReviewPending {
            gate: stage.name.clone(),
            artifact_key: request.artifact_key.clone(),
            round,
        });
        self.checkpoint(run).await?;
        Ok(RunStep::Suspended(request))
    }

    // -----------------------------------------------------------------------
    // Agent stages
    // -----------------------------------------------------------------------

    async fn execute_single(
        &self,
        run: &mut PipelineRun,
        stage: &StageDescriptor,
        capabilities: &ResolvedCapabilities,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let view = run.state.view(&stage.inputs);
        let guidance = run.guidance.get(&stage.name).cloned().unwrap_or_default();
        let (fragment, attempts) = self
            .attempt_loop(stage, &view, guidance, capabilities.for_stage(&stage.name), cancel)
            .await;
        run.attempts.extend(attempts);
        self.merge(run, stage, fragment?)
    }

    /// Run independent stages concurrently. Each gets its own view; results
    /// are merged in declared order. Successful siblings are kept even if
    /// another one fails. A fatal error cancels the remaining siblings and
    /// decides the outcome; otherwise the first failure in declared order does.
    async fn execute_parallel(
        &self,
        run: &mut PipelineRun,
        stages: &[StageDescriptor],
        capabilities: &ResolvedCapabilities,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let step_cancel = cancel.child_token();
        let views: Vec<StateView> = stages.iter().map(|s| run.state.view(&s.inputs)).collect();
        let executions = stages.iter().zip(&views).map(|(stage, view)| {
            let guidance = run.guidance.get(&stage.name).cloned().unwrap_or_default();
            let caps = capabilities.for_stage(&stage.name);
            let step_cancel = &step_cancel;
            async move {
                let (fragment, attempts) = self
                    .attempt_loop(stage, view, guidance, caps, step_cancel)
                    .await;
                if let Err(e) = &fragment {
                    if e.is_fatal() {
                        tracing::warn!(stage = %stage.name, error = %e, "Cancelling parallel siblings");
                        step_cancel.cancel();
                    }
                }
                (fragment, attempts)
            }
        });
        let results = futures::future::join_all(executions).await;

        let mut errors = Vec::new();
        for (stage, (fragment, attempts)) in stages.iter().zip(results) {
            run.attempts.extend(attempts);
            match fragment {
                Ok(fragment) => self.merge(run, stage, fragment)?,
                Err(e) => {
                    tracing::warn!(stage = %stage.name, error = %e, "Parallel stage failed");
                    errors.push(e);
                }
            }
        }
        match errors.into_iter().min_by_key(parallel_error_rank) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The bounded retry loop around one agent stage.
    async fn attempt_loop(
        &self,
        stage: &StageDescriptor,
        view: &StateView,
        mut guidance: Vec<String>,
        capabilities: StageCapabilities,
        cancel: &CancellationToken,
    ) -> StageExecution {
        let free_text;
        let schema = match stage.agent_spec().and_then(|spec| spec.schema.as_ref()) {
            Some(schema) => schema,
            None => {
                free_text = OutputSchema::new(Shape::text_min(1));
                &free_text
            }
        };

        let mut attempts = Vec::new();
        let mut last_error = None;

        for attempt in 1..=self.retry.max_attempts {
            if attempt > 1 {
                if let Err(e) = retry::pause(&self.retry.backoff, attempt - 2, cancel).await {
                    return (Err(e), attempts);
                }
            }
            self.events.emit(PipelineEvent::StageStarted {
                stage: stage.name.clone(),
                attempt,
            });

            let ctx = AttemptContext {
                attempt,
                guidance: &guidance,
                capabilities: &capabilities,
            };
            let invocation = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                attempt = self.adapter.run(stage, view, &ctx) => Some(attempt),
            };
            let Some(StageAttempt {
                output,
                mut metadata,
            }) = invocation
            else {
                let mut metadata = AttemptMetadata::new(&stage.name, attempt, "");
                metadata.finish(AttemptOutcome::Cancelled, None);
                attempts.push(metadata);
                return (Err(BsjError::Cancelled), attempts);
            };

            if metadata.tool_fallback {
                for tool in &metadata.degraded_tools {
                    self.events.emit(PipelineEvent::ToolFallback {
                        stage: stage.name.clone(),
                        tool: tool.clone(),
                    });
                }
            }

            let error = match output {
                Ok(raw) => match self.validator.validate(&raw, schema, view) {
                    ValidationResult::Pass(payload) => {
                        metadata.finish(AttemptOutcome::Passed, None);
                        tracing::info!(
                            stage = %stage.name,
                            attempt,
                            duration_ms = metadata.duration_ms,
                            tool_fallback = metadata.tool_fallback,
                            "Stage passed validation"
                        );
                        self.events.emit(PipelineEvent::StageCompleted {
                            stage: stage.name.clone(),
                            attempt,
                            duration_ms: metadata.duration_ms,
                        });
                        attempts.push(metadata);
                        return (Ok(fragment_for(stage, payload)), attempts);
                    }
                    ValidationResult::Fail(diagnostic) => {
                        metadata.finish(AttemptOutcome::Malformed, Some(diagnostic.clone()));
                        BsjError::MalformedResponse {
                            stage: stage.name.clone(),
                            diagnostic,
                        }
                    }
                },
                Err(e) if e.is_recoverable() => e,
                Err(e) => {
                    attempts.push(metadata);
                    return (Err(e), attempts);
                }
            };
            attempts.push(metadata);

            let diagnostic = diagnostic_of(&error);
            tracing::warn!(
                stage = %stage.name,
                attempt,
                max_attempts = self.retry.max_attempts,
                diagnostic = %diagnostic,
                "Stage output rejected"
            );
            if attempt < self.retry.max_attempts {
                self.events.emit(PipelineEvent::StageRetrying {
                    stage: stage.name.clone(),
                    attempt,
                    diagnostic: diagnostic.clone(),
                });
            }
            guidance.push(format!(
                "Your previous response was rejected: {diagnostic}. Return corrected output that satisfies the required shape."
            ));
            last_error = Some(error);
        }

        let error = last_error.unwrap_or_else(|| {
            BsjError::InvariantViolation(format!("stage '{}' made no attempts", stage.name))
        });
        (Err(error), attempts)
    }

    fn merge(
        &self,
        run: &mut PipelineRun,
        stage: &StageDescriptor,
        fragment: BTreeMap<String, Value>,
    ) -> Result<()> {
        let keys = run.state.merge(&stage.name, fragment, self.merge_policy)?;
        self.events.emit(PipelineEvent::StateMerged {
            stage: stage.name.clone(),
            keys,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Termination and persistence
    // -----------------------------------------------------------------------

    /// End the run for an error. Expected failures become a terminal status;
    /// anything else is recorded on the run and returned.
    async fn abort(&self, run: &mut PipelineRun, err: BsjError) -> Result<RunStep> {
        match terminal_status(&err) {
            Some(status) => {
                let report = self.finish(run, status, Some(err.to_string())).await?;
                Ok(RunStep::Finished(report))
            }
            None => {
                tracing::error!(run_id = %run.id, error = %err, "Run aborted by unexpected error");
                run.reason = Some(err.to_string());
                run.touch();
                if let Err(save_err) = self.checkpoint(run).await {
                    tracing::warn!(error = %save_err, "Could not save aborted run");
                }
                Err(err)
            }
        }
    }

    async fn finish(
        &self,
        run: &mut PipelineRun,
        status: RunStatus,
        reason: Option<String>,
    ) -> Result<RunReport> {
        run.phase = RunPhase::Finished { status };
        run.reason = reason;
        run.touch();
        match &run.reason {
            Some(reason) => tracing::info!(run_id = %run.id, status = %status, reason = %reason, "Run finished"),
            None => tracing::info!(run_id = %run.id, status = %status, "Run finished"),
        }
        self.events.emit(PipelineEvent::RunFinished {
            run_id: run.id.clone(),
            status,
            duration_ms: run.elapsed_ms(),
        });
        self.checkpoint(run).await?;
        Ok(run.report())
    }

    async fn checkpoint(&self, run: &PipelineRun) -> Result<()> {
        if let Some(dir) = &self.checkpoint_dir {
            checkpoint::save_run(run, dir).await?;
            self.events.emit(PipelineEvent::CheckpointSaved {
                run_id: run.id.clone(),
            });
        }
        Ok(())
    }
}

/// The validated payload under the stage's artifact key, plus its Markdown
/// rendering when the stage declares a `*_markdown` output.
fn fragment_for(stage: &StageDescriptor, payload: Value) -> BTreeMap<String, Value> {
    let mut fragment = BTreeMap::new();
    let Some(artifact) = stage.artifact_key() else {
        return fragment;
    };
    if let Some(markdown_key) = stage.markdown_key() {
        fragment.insert(
            markdown_key.to_string(),
            Value::String(render::artifact_markdown(artifact, &payload)),
        );
    }
    fragment.insert(artifact.to_string(), payload);
    fragment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert_eq!(
            terminal_status(&BsjError::EmptyResponse { stage: "s".into() }),
            Some(RunStatus::ValidationFailed)
        );
        assert_eq!(
            terminal_status(&BsjError::ProviderUnavailable {
                provider: "google".into(),
                status: Some(401),
                message: "bad key".into()
            }),
            Some(RunStatus::ProviderError)
        );
        assert_eq!(terminal_status(&BsjError::Cancelled), Some(RunStatus::Cancelled));
        assert_eq!(
            terminal_status(&BsjError::InvariantViolation("x".into())),
            None
        );
    }

    #[test]
    fn fatal_sibling_error_outranks_validation() {
        let errors = vec![
            BsjError::MalformedResponse {
                stage: "thumbnail_promptor".into(),
                diagnostic: "expected a JSON array".into(),
            },
            BsjError::Cancelled,
            BsjError::ProviderUnavailable {
                provider: "google".into(),
                status: Some(401),
                message: "bad key".into(),
            },
        ];
        let chosen = errors.into_iter().min_by_key(parallel_error_rank).unwrap();
        assert_eq!(terminal_status(&chosen), Some(RunStatus::ProviderError));

        let errors = vec![
            BsjError::EmptyResponse { stage: "a".into() },
            BsjError::MalformedResponse {
                stage: "b".into(),
                diagnostic: "x".into(),
            },
        ];
        let chosen = errors.into_iter().min_by_key(parallel_error_rank).unwrap();
        assert!(matches!(chosen, BsjError::EmptyResponse { ref stage } if stage == "a"));
    }

    #[test]
    fn fragment_includes_markdown_companion() {
        let stage = StageDescriptor::agent("voiceover", "v").writes(["voiceover", "voiceover_markdown"]);
        let fragment = fragment_for(&stage, serde_json::json!({"text": "Hello", "voice_id": null}));
        assert_eq!(fragment.len(), 2);
        assert!(fragment["voiceover_markdown"]
            .as_str()
            .unwrap()
            .starts_with("# Voiceover"));

        let stage = StageDescriptor::agent("thumbs", "t").writes(["thumbnail_prompts"]);
        let fragment = fragment_for(&stage, serde_json::json!(["a", "b", "c"]));
        assert_eq!(fragment.keys().collect::<Vec<_>>(), vec!["thumbnail_prompts"]);
    }
}
