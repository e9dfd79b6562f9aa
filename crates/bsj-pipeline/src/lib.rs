//! Workflow orchestrator for the BSJ content pipeline.
//!
//! This crate sequences agent stages over a shared session state, checks each
//! agent response against a declared output schema, retries with diagnostics,
//! and suspends at review gates until a human (or proxy) decides. The fixed
//! BSJ topology lives in [`bsj`]; everything else is topology-agnostic.

pub mod adapter;
pub mod bsj;
pub mod capability;
pub mod checkpoint;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod render;
pub mod retry;
pub mod review;
pub mod run;
pub mod schema;
pub mod stage;
pub mod validator;

pub use adapter::{AgentStageAdapter, AttemptContext, StageAttempt};
pub use capability::{CapabilityPlan, ResolvedCapabilities, StageCapabilities};
pub use checkpoint::{clear_run, load_run, save_run};
pub use config::PipelineConfig;
pub use events::{EventEmitter, PipelineEvent};
pub use orchestrator::Orchestrator;
pub use retry::{BackoffPolicy, RejectionPolicy, RetryPolicy};
pub use review::{
    AutoApprove, ChannelReviewer, ConsoleReviewer, GateState, ReviewChannel, ReviewGate,
    ReviewHandle, ReviewRequest, ScriptedReviewer,
};
pub use run::{PipelineRun, RunPhase, RunReport, RunStep, TOPIC_KEY};
pub use schema::{FieldSpec, Grounding, OutputSchema, Shape, UnknownKeyPolicy};
pub use stage::{AgentSpec, CapabilityRequirement, StageDescriptor, StageKind, Step, Topology};
pub use validator::{extract_json, RawOutput, ValidationResult, Validator};

pub use bsj_types::{
    AttemptMetadata, AttemptOutcome, BsjError, MergePolicy, Result, ReviewDecision, RunStatus,
    SessionState, StateView,
};
