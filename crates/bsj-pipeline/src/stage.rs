//! Stage descriptors and pipeline topology.
//!
//! A [`Topology`] is the fixed, ordered list of [`Step`]s a run walks through.
//! It is checked once by [`Topology::validate`] before any run starts, so a
//! miswired pipeline is a construction-time `ConfigurationError` rather than a
//! runtime surprise.

use std::collections::{BTreeMap, BTreeSet};

use crate::schema::OutputSchema;
use bsj_types::{BsjError, Result};

/// A named tool a stage wants attached to its model invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequirement {
    pub name: String,
    pub required: bool,
}

/// Agent-specific part of a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSpec {
    pub instruction: String,
    pub schema: Option<OutputSchema>,
    /// `None` uses the provider default.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub capabilities: Vec<CapabilityRequirement>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    Agent(AgentSpec),
    ReviewGate {
        /// Name of the stage whose artifact is reviewed.
        reviews: String,
        /// State key holding the artifact shown to the reviewer.
        artifact_key: String,
    },
}

/// Immutable description of one pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDescriptor {
    pub name: String,
    pub description: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub kind: StageKind,
}

impl StageDescriptor {
    pub fn agent(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            kind: StageKind::Agent(AgentSpec {
                instruction: instruction.into(),
                schema: None,
                model: None,
                temperature: None,
                capabilities: Vec::new(),
            }),
        }
    }

    /// A gate on `reviews`, showing `artifact_key` and recording the verdict
    /// under `review_key`.
    pub fn review_gate(
        name: impl Into<String>,
        reviews: impl Into<String>,
        artifact_key: impl Into<String>,
        review_key: impl Into<String>,
    ) -> Self {
        let artifact_key = artifact_key.into();
        Self {
            name: name.into(),
            description: String::new(),
            inputs: vec![artifact_key.clone()],
            outputs: vec![review_key.into()],
            kind: StageKind::ReviewGate {
                reviews: reviews.into(),
                artifact_key,
            },
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn reads<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn writes<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn schema(mut self, schema: OutputSchema) -> Self {
        if let StageKind::Agent(spec) = &mut self.kind {
            spec.schema = Some(schema);
        }
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        if let StageKind::Agent(spec) = &mut self.kind {
            spec.model = Some(model.into());
        }
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        if let StageKind::Agent(spec) = &mut self.kind {
            spec.temperature = Some(temperature);
        }
        self
    }

    pub fn requires_tool(self, name: impl Into<String>) -> Self {
        self.capability(name, true)
    }

    pub fn optional_tool(self, name: impl Into<String>) -> Self {
        self.capability(name, false)
    }

    fn capability(mut self, name: impl Into<String>, required: bool) -> Self {
        if let StageKind::Agent(spec) = &mut self.kind {
            spec.capabilities.push(CapabilityRequirement {
                name: name.into(),
                required,
            });
        }
        self
    }

    pub fn is_review_gate(&self) -> bool {
        matches!(self.kind, StageKind::ReviewGate { .. })
    }

    pub fn agent_spec(&self) -> Option<&AgentSpec> {
        match &self.kind {
            StageKind::Agent(spec) => Some(spec),
            StageKind::ReviewGate { .. } => None,
        }
    }

    /// Key the validated payload is written under.
    pub fn artifact_key(&self) -> Option<&str> {
        self.outputs.first().map(String::as_str)
    }

    /// Companion key holding the Markdown rendering of the artifact, if the
    /// stage declares one.
    pub fn markdown_key(&self) -> Option<&str> {
        let artifact = self.artifact_key()?;
        self.outputs
            .iter()
            .skip(1)
            .find(|k| k.strip_suffix("_markdown") == Some(artifact))
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Step / Topology
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Single(StageDescriptor),
    /// Stages that neither read nor write each other's keys and may run
    /// concurrently. Outputs are merged in declared order.
    Parallel(Vec<StageDescriptor>),
}

impl Step {
    pub fn stages(&self) -> &[StageDescriptor] {
        match self {
            Step::Single(stage) => std::slice::from_ref(stage),
            Step::Parallel(stages) => stages,
        }
    }

    pub fn label(&self) -> String {
        match self {
            Step::Single(stage) => stage.name.clone(),
            Step::Parallel(stages) => {
                let names: Vec<&str> = stages.iter().map(|s| s.name.as_str()).collect();
                format!("parallel({})", names.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    pub name: String,
    /// Keys written before the first stage runs.
    pub seeds: Vec<String>,
    pub steps: Vec<Step>,
}

impl Topology {
    pub fn new(name: impl Into<String>, seeds: Vec<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            seeds,
            steps,
        }
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageDescriptor> + '_ {
        self.steps.iter().flat_map(|s| s.stages())
    }

    pub fn stage(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages().find(|s| s.name == name)
    }

    /// Index of the step containing stage `name`.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.stages().iter().any(|s| s.name == name))
    }

    /// Every key some stage declares as output.
    pub fn output_keys(&self) -> Vec<&str> {
        self.stages()
            .flat_map(|s| s.outputs.iter().map(String::as_str))
            .collect()
    }

    /// Check the wiring rules. Any violation is a `ConfigurationError`.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(BsjError::ConfigurationError(msg));

        if self.steps.is_empty() {
            return fail(format!("topology '{}' has no steps", self.name));
        }

        let mut names = BTreeSet::new();
        let mut available: BTreeSet<&str> = self.seeds.iter().map(String::as_str).collect();

        for (index, step) in self.steps.iter().enumerate() {
            // key -> writing stage, within this step only
            let mut step_writes: BTreeMap<&str, &str> = BTreeMap::new();
            for stage in step.stages() {
                if !names.insert(stage.name.as_str()) {
                    return fail(format!("duplicate stage name '{}'", stage.name));
                }
                for key in &stage.outputs {
                    if available.contains(key.as_str()) {
                        return fail(format!(
                            "key '{}' written by stage '{}' is already produced upstream",
                            key, stage.name
                        ));
                    }
                    match step_writes.insert(key.as_str(), stage.name.as_str()) {
                        Some(other) if other == stage.name => {
                            return fail(format!("stage '{other}' lists output '{key}' twice"));
                        }
                        Some(other) => {
                            return fail(format!(
                                "parallel stages '{}' and '{}' both write '{}'",
                                other, stage.name, key
                            ));
                        }
                        None => {}
                    }
                }
                check_stage_shape(stage)?;
            }

            match step {
                Step::Single(stage) => {
                    if let StageKind::ReviewGate {
                        reviews,
                        artifact_key,
                    } = &stage.kind
                    {
                        let previous = index
                            .checked_sub(1)
                            .and_then(|i| self.steps.get(i));
                        let reviewed = match previous {
                            Some(Step::Single(prev)) if &prev.name == reviews => prev,
                            _ => {
                                return fail(format!(
                                    "gate '{}' must directly follow the stage it reviews ('{}')",
                                    stage.name, reviews
                                ))
                            }
                        };
                        if reviewed.is_review_gate() {
                            return fail(format!("gate '{}' reviews another gate", stage.name));
                        }
                        if !reviewed.outputs.contains(artifact_key) {
                            return fail(format!(
                                "gate '{}' shows '{}', which '{}' does not produce",
                                stage.name, artifact_key, reviews
                            ));
                        }
                    }
                    check_inputs(stage, &available)?;
                    available.extend(stage.outputs.iter().map(String::as_str));
                }
                Step::Parallel(stages) => {
                    if stages.len() < 2 {
                        return fail(format!("parallel step {index} needs at least two stages"));
                    }
                    for a in stages {
                        if a.is_review_gate() {
                            return fail(format!("gate '{}' cannot run in parallel", a.name));
                        }
                        for b in stages.iter().filter(|b| b.name != a.name) {
                            if let Some(key) = a.inputs.iter().find(|k| b.outputs.contains(*k)) {
                                return fail(format!(
                                    "parallel stage '{}' reads '{}' written by sibling '{}'",
                                    a.name, key, b.name
                                ));
                            }
                        }
                        check_inputs(a, &available)?;
                    }
                    for stage in stages {
                        available.extend(stage.outputs.iter().map(String::as_str));
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_inputs(stage: &StageDescriptor, available: &BTreeSet<&str>) -> Result<()> {
    match stage.inputs.iter().find(|k| !available.contains(k.as_str())) {
        Some(key) => Err(BsjError::ConfigurationError(format!(
            "stage '{}' reads '{}', which no earlier stage produces",
            stage.name, key
        ))),
        None => Ok(()),
    }
}

fn check_stage_shape(stage: &StageDescriptor) -> Result<()> {
    let fail = |msg: String| Err(BsjError::ConfigurationError(msg));
    match &stage.kind {
        StageKind::Agent(spec) => {
            let Some(artifact) = stage.artifact_key() else {
                return fail(format!("agent stage '{}' declares no output", stage.name));
            };
            let expected_markdown = format!("{artifact}_markdown");
            if let Some(extra) = stage.outputs.iter().skip(1).find(|k| **k != expected_markdown) {
                return fail(format!(
                    "stage '{}' declares output '{}'; only '{}' may accompany '{}'",
                    stage.name, extra, expected_markdown, artifact
                ));
            }
            if let Some(grounding) = spec.schema.as_ref().and_then(|s| s.grounding.as_ref()) {
                for key in [&grounding.topic_key, &grounding.research_key] {
                    if !stage.inputs.contains(key) {
                        return fail(format!(
                            "stage '{}' grounds on '{}' without declaring it as input",
                            stage.name, key
                        ));
                    }
                }
            }
            if spec.capabilities.iter().any(|c| c.name.trim().is_empty()) {
                return fail(format!("stage '{}' names an empty capability", stage.name));
            }
            Ok(())
        }
        StageKind::ReviewGate { .. } => {
            if stage.outputs.len() != 1 {
                return fail(format!("gate '{}' must write exactly one review key", stage.name));
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, Shape};

    fn agent(name: &str, reads: &[&str], writes: &[&str]) -> StageDescriptor {
        StageDescriptor::agent(name, "do the thing")
            .reads(reads.iter().copied())
            .writes(writes.iter().copied())
    }

    fn topology(steps: Vec<Step>) -> Topology {
        Topology::new("test", vec!["topic".into()], steps)
    }

    fn assert_config_error(result: Result<()>, needle: &str) {
        match result {
            Err(BsjError::ConfigurationError(msg)) => {
                assert!(msg.contains(needle), "message {msg:?} lacks {needle:?}")
            }
            other => panic!("expected ConfigurationError, got {other:?}"),
        }
    }

    #[test]
    fn linear_chain_with_gate_is_valid() {
        let t = topology(vec![
            Step::Single(agent("researcher", &["topic"], &["research", "research_markdown"])),
            Step::Single(StageDescriptor::review_gate(
                "research_review",
                "researcher",
                "research_markdown",
                "research_review",
            )),
            Step::Single(agent("scriptwriter", &["topic", "research"], &["script"])),
        ]);
        assert!(t.validate().is_ok());
        assert_eq!(t.step_index("scriptwriter"), Some(2));
        assert_eq!(
            t.stage("researcher").unwrap().markdown_key(),
            Some("research_markdown")
        );
        assert!(t.stage("research_review").unwrap().is_review_gate());
    }

    #[test]
    fn parallel_key_collision_rejected() {
        let t = topology(vec![Step::Parallel(vec![
            agent("thumbs", &["topic"], &["assets"]),
            agent("captions", &["topic"], &["assets"]),
        ])]);
        assert_config_error(t.validate(), "both write 'assets'");
    }

    #[test]
    fn parallel_sibling_read_rejected() {
        let t = topology(vec![Step::Parallel(vec![
            agent("thumbs", &["topic"], &["thumbnail_prompts"]),
            agent("captions", &["topic", "thumbnail_prompts"], &["captions"]),
        ])]);
        assert_config_error(t.validate(), "written by sibling 'thumbs'");
    }

    #[test]
    fn undeclared_input_rejected() {
        let t = topology(vec![Step::Single(agent("scriptwriter", &["research"], &["script"]))]);
        assert_config_error(t.validate(), "reads 'research'");
    }

    #[test]
    fn gate_must_follow_reviewed_stage() {
        let t = topology(vec![
            Step::Single(agent("researcher", &["topic"], &["research"])),
            Step::Single(agent("scriptwriter", &["research"], &["script"])),
            Step::Single(StageDescriptor::review_gate(
                "research_review",
                "researcher",
                "research",
                "research_review",
            )),
        ]);
        assert_config_error(t.validate(), "must directly follow");
    }

    #[test]
    fn gate_artifact_must_come_from_reviewed_stage() {
        let t = topology(vec![
            Step::Single(agent("researcher", &["topic"], &["research"])),
            Step::Single(StageDescriptor::review_gate(
                "research_review",
                "researcher",
                "topic",
                "research_review",
            )),
        ]);
        assert_config_error(t.validate(), "does not produce");
    }

    #[test]
    fn duplicate_output_rejected() {
        let t = topology(vec![
            Step::Single(agent("a", &["topic"], &["x"])),
            Step::Single(agent("b", &["topic"], &["x"])),
        ]);
        assert_config_error(t.validate(), "already produced upstream");
    }

    #[test]
    fn extra_outputs_limited_to_markdown_companion() {
        let t = topology(vec![Step::Single(agent("a", &["topic"], &["x", "y"]))]);
        assert_config_error(t.validate(), "only 'x_markdown'");
    }

    #[test]
    fn grounding_keys_must_be_inputs() {
        let schema = crate::schema::OutputSchema::new(Shape::object(vec![FieldSpec::required(
            "draft",
            Shape::text(),
        )]))
        .grounded_on("draft", "topic", "research");
        let t = topology(vec![Step::Single(
            agent("scriptwriter", &["topic"], &["script"]).schema(schema),
        )]);
        assert_config_error(t.validate(), "grounds on 'research'");
    }

    #[test]
    fn single_stage_parallel_rejected() {
        let t = topology(vec![Step::Parallel(vec![agent("a", &["topic"], &["x"])])]);
        assert_config_error(t.validate(), "at least two stages");
    }

    #[test]
    fn builder_records_capabilities() {
        let stage = agent("researcher", &["topic"], &["research"])
            .optional_tool("web_search")
            .requires_tool("fetch_url")
            .model("gemini-2.5-pro");
        let spec = stage.agent_spec().unwrap();
        assert_eq!(spec.capabilities.len(), 2);
        assert!(!spec.capabilities[0].required);
        assert!(spec.capabilities[1].required);
        assert_eq!(spec.model.as_deref(), Some("gemini-2.5-pro"));
    }
}
