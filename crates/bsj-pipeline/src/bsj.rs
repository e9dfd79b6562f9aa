//! The fixed BSJ content topology.
//!
//! research -> review -> script -> review -> {thumbnail prompts, captions}
//! -> voiceover (-> newsletter).

use serde_json::Value;

use crate::config::PipelineConfig;
use crate::run::TOPIC_KEY;
use crate::schema::{FieldSpec, OutputSchema, Shape};
use crate::stage::{CapabilityRequirement, StageDescriptor, StageKind, Step, Topology};
use bsj_types::{BsjError, Result};

pub const TOPOLOGY_NAME: &str = "bsj";

pub const WEB_SEARCH: &str = "web_search";
pub const FETCH_URL: &str = "fetch_url";
pub const TEXT_TO_SPEECH: &str = "text_to_speech";

const RESEARCHER: &str = "You are the BSJ researcher. Read the `topic` key and stay strictly on that topic.
If search or fetch tools are attached, search first and then fetch the most relevant pages in full before answering.
If no tools are attached, answer from what you know and keep the lists short rather than inventing sources.
Report the subtopics worth covering, concrete statistics with their source, and the pages you relied on.";

const SCRIPTWRITER: &str = "You are the BSJ scriptwriter. Use `research.topics` and `research.key_stats` to craft a BSJ-tone narrative about `topic`.
Produce 5 to 8 beats, a 400 to 700 word draft, and a summary of at most 60 words.
Stay on the topic; do not drift into unrelated subjects.";

const THUMBNAIL_PROMPTOR: &str = "You are the BSJ thumbnail promptor. Using `script.summary`, write exactly 3 Afrofuturist-style image prompts that would work as YouTube thumbnails.";

const CAPTIONER: &str = "You are the BSJ captioner. Using `script.summary` and `topic`, write captions for YouTube, TikTok and Instagram plus one shared hashtag set.";

const VOICEOVER: &str = "You are the BSJ voiceover generator. Using `script.draft` and `topic`, write voiceover-ready narration in the BSJ voice: clear, engaging, easy to read aloud.
If a speech tool is attached you may synthesize the narration and report the returned audio path.";

const NEWSLETTER: &str = "You are the BSJ newsletter rewriter. Turn `script` into a short newsletter issue about `topic` with three candidate subject lines.";

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

pub fn research_schema() -> OutputSchema {
    OutputSchema::new(Shape::object(vec![
        FieldSpec::required("topics", Shape::list_of(Shape::text_min(1), 1)),
        FieldSpec::optional(
            "key_stats",
            Shape::list_of(
                Shape::object(vec![
                    FieldSpec::required("label", Shape::text_min(1)),
                    FieldSpec::required("value", Shape::text_min(1)),
                    FieldSpec::optional("source", Shape::text()),
                ]),
                0,
            ),
        ),
        FieldSpec::optional(
            "citations",
            Shape::list_of(
                Shape::object(vec![
                    FieldSpec::required("title", Shape::text()),
                    FieldSpec::required("url", Shape::text_min(1)),
                ]),
                0,
            ),
        ),
    ]))
    .with_envelope("research")
}

pub fn script_schema() -> OutputSchema {
    OutputSchema::new(Shape::object(vec![
        FieldSpec::required("beats", Shape::list_of(Shape::text_min(1), 3)),
        FieldSpec::required("draft", Shape::text_min(100)),
        FieldSpec::required("summary", Shape::text_min(10)),
    ]))
    .with_envelope("script")
    .grounded_on("draft", TOPIC_KEY, "research")
}

pub fn thumbnail_schema() -> OutputSchema {
    OutputSchema::new(Shape::list_of(Shape::text_min(1), 3)).with_envelope("thumbnail_prompts")
}

pub fn captions_schema() -> OutputSchema {
    let platform = || Shape::list_of(Shape::text_min(1), 2);
    OutputSchema::new(Shape::object(vec![
        FieldSpec::required("youtube", platform()),
        FieldSpec::required("tiktok", platform()),
        FieldSpec::required("instagram", platform()),
        FieldSpec::required("hashtags", Shape::list_of(Shape::text_min(1), 8)),
    ]))
    .with_envelope("captions")
}

pub fn voiceover_schema() -> OutputSchema {
    OutputSchema::new(Shape::object(vec![
        FieldSpec::required("text", Shape::text_min(1)),
        FieldSpec::optional("voice_id", Shape::Any).with_default(Value::Null),
        FieldSpec::optional("audio_path", Shape::text()),
    ]))
    .with_envelope("voiceover")
    .grounded_on("text", TOPIC_KEY, "research")
}

pub fn newsletter_schema() -> OutputSchema {
    OutputSchema::new(Shape::object(vec![
        FieldSpec::required("body", Shape::text_min(1)),
        FieldSpec::required("subjects", Shape::list_of(Shape::text_min(1), 3)),
    ]))
    .with_envelope("newsletter")
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Build the BSJ topology for `config`. Fails when `stage_tools` names a
/// stage that does not exist or is a gate.
pub fn topology(config: &PipelineConfig) -> Result<Topology> {
    let researcher = StageDescriptor::agent("researcher", RESEARCHER)
        .describe("Research subtopics, key stats, and citations")
        .reads([TOPIC_KEY])
        .writes(["research", "research_markdown"])
        .schema(research_schema())
        .model(&config.research_model)
        .optional_tool(WEB_SEARCH)
        .optional_tool(FETCH_URL);

    let scriptwriter = StageDescriptor::agent("scriptwriter", SCRIPTWRITER)
        .describe("Beats, draft, and summary")
        .reads([TOPIC_KEY, "research"])
        .writes(["script", "script_markdown"])
        .schema(script_schema());

    let thumbnails = StageDescriptor::agent("thumbnail_promptor", THUMBNAIL_PROMPTOR)
        .describe("Three thumbnail image prompts")
        .reads([TOPIC_KEY, "script"])
        .writes(["thumbnail_prompts"])
        .schema(thumbnail_schema());

    let captions = StageDescriptor::agent("captioner", CAPTIONER)
        .describe("Per-platform captions and hashtags")
        .reads([TOPIC_KEY, "script"])
        .writes(["captions", "captions_markdown"])
        .schema(captions_schema());

    let voiceover = StageDescriptor::agent("voiceover", VOICEOVER)
        .describe("Narration text, optionally synthesized")
        .reads([TOPIC_KEY, "research", "script"])
        .writes(["voiceover", "voiceover_markdown"])
        .schema(voiceover_schema())
        .optional_tool(TEXT_TO_SPEECH);

    let mut steps = vec![
        Step::Single(researcher),
        Step::Single(
            StageDescriptor::review_gate(
                "research_review",
                "researcher",
                "research_markdown",
                "research_review",
            )
            .describe("Human approval of the research"),
        ),
        Step::Single(scriptwriter),
        Step::Single(
            StageDescriptor::review_gate("script_review", "scriptwriter", "script_markdown", "script_review")
                .describe("Human approval of the script"),
        ),
        Step::Parallel(vec![thumbnails, captions]),
        Step::Single(voiceover),
    ];
    if config.include_newsletter {
        steps.push(Step::Single(
            StageDescriptor::agent("newsletter", NEWSLETTER)
                .describe("Newsletter body and subject lines")
                .reads([TOPIC_KEY, "research", "script"])
                .writes(["newsletter"])
                .schema(newsletter_schema()),
        ));
    }

    let mut topology = Topology::new(TOPOLOGY_NAME, vec![TOPIC_KEY.to_string()], steps);
    apply_tool_overrides(&mut topology, config)?;
    Ok(topology)
}

fn apply_tool_overrides(topology: &mut Topology, config: &PipelineConfig) -> Result<()> {
    for (stage_name, tools) in &config.stage_tools {
        let stage = topology
            .steps
            .iter_mut()
            .flat_map(|step| match step {
                Step::Single(stage) => std::slice::from_mut(stage),
                Step::Parallel(stages) => stages.as_mut_slice(),
            })
            .find(|s| &s.name == stage_name)
            .ok_or_else(|| {
                BsjError::ConfigurationError(format!("stage_tools names unknown stage '{stage_name}'"))
            })?;
        let StageKind::Agent(spec) = &mut stage.kind else {
            return Err(BsjError::ConfigurationError(format!(
                "stage_tools cannot attach tools to gate '{stage_name}'"
            )));
        };
        spec.capabilities = tools
            .iter()
            .map(|name| CapabilityRequirement {
                name: name.clone(),
                required: false,
            })
            .collect();
        tracing::debug!(stage = %stage_name, tools = ?tools, "Tool attachment overridden");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::{RawOutput, Validator};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn default_topology_is_valid() {
        let topology = topology(&PipelineConfig::default()).unwrap();
        topology.validate().unwrap();
        let names: Vec<&str> = topology.stages().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "researcher",
                "research_review",
                "scriptwriter",
                "script_review",
                "thumbnail_promptor",
                "captioner",
                "voiceover"
            ]
        );
        let researcher = topology.stage("researcher").unwrap().agent_spec().unwrap();
        assert_eq!(researcher.model.as_deref(), Some("gemini-2.5-pro"));
        assert_eq!(researcher.capabilities.len(), 2);
    }

    #[test]
    fn newsletter_is_opt_in() {
        let config = PipelineConfig {
            include_newsletter: true,
            ..Default::default()
        };
        let topology = topology(&config).unwrap();
        topology.validate().unwrap();
        assert!(topology.stage("newsletter").is_some());
    }

    #[test]
    fn tool_overrides_replace_attachment() {
        let config = PipelineConfig {
            stage_tools: BTreeMap::from([("researcher".to_string(), vec![WEB_SEARCH.to_string()])]),
            ..Default::default()
        };
        let topology = topology(&config).unwrap();
        let caps = &topology.stage("researcher").unwrap().agent_spec().unwrap().capabilities;
        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].name, WEB_SEARCH);

        let config = PipelineConfig {
            stage_tools: BTreeMap::from([("editor".to_string(), vec![])]),
            ..Default::default()
        };
        assert!(matches!(
            super::topology(&config),
            Err(BsjError::ConfigurationError(_))
        ));

        let config = PipelineConfig {
            stage_tools: BTreeMap::from([("script_review".to_string(), vec![])]),
            ..Default::default()
        };
        assert!(super::topology(&config).is_err());
    }

    #[test]
    fn captions_need_enough_hashtags() {
        let raw = RawOutput::Structured(json!({
            "captions": {
                "youtube": ["a", "b"],
                "tiktok": ["c", "d"],
                "instagram": ["e", "f"],
                "hashtags": ["#one", "#two"]
            }
        }));
        let result = Validator::default().validate(&raw, &captions_schema(), &Default::default());
        assert_eq!(
            result.diagnostic(),
            Some("expected at least 8 items at 'hashtags', found 2")
        );
    }

    #[test]
    fn voiceover_defaults_fill_in() {
        let view: bsj_types::StateView =
            BTreeMap::from([("topic".to_string(), json!("AI in African fintech"))]).into();
        let raw = RawOutput::Text(
            r#"{"voiceover": {"text": "African fintech is rewriting how credit works."}}"#.into(),
        );
        let result = Validator::default().validate(&raw, &voiceover_schema(), &view);
        assert_eq!(
            result.payload(),
            Some(&json!({
                "text": "African fintech is rewriting how credit works.",
                "voice_id": null,
                "audio_path": ""
            }))
        );
    }
}
