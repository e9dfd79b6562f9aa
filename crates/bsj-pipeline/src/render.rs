//! Human-readable views of session state.
//!
//! [`artifact_markdown`] renders one artifact (this is what review gates
//! show and what the `*_markdown` keys hold); [`run_markdown`] stitches the
//! artifacts of a whole run together; [`flatten_state`] gives a flat
//! `key.path -> text` listing.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde_json::Value;

use crate::run::TOPIC_KEY;
use bsj_types::SessionState;

/// Artifact keys in the order a finished run presents them.
pub const ARTIFACT_ORDER: &[&str] = &[
    "research",
    "script",
    "thumbnail_prompts",
    "captions",
    "voiceover",
    "newsletter",
];

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn items(value: &Value) -> Vec<&Value> {
    value
        .as_array()
        .map(|a| a.iter().collect())
        .unwrap_or_default()
}

fn bullets(out: &mut String, heading: &str, list: &Value) {
    let _ = write!(out, "\n\n**{heading}**");
    for item in items(list) {
        let _ = write!(out, "\n- {}", text(item));
    }
}

fn title_case(key: &str) -> String {
    key.split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Long-form Markdown for the artifact stored under `key`.
pub fn artifact_markdown(key: &str, value: &Value) -> String {
    let mut out = String::new();
    match key {
        "research" => {
            out.push_str("# Research Findings");
            bullets(&mut out, "Topics", &value["topics"]);
            out.push_str("\n\n**Key Stats**");
            for stat in items(&value["key_stats"]) {
                let _ = write!(out, "\n- {}: {}", text(&stat["label"]), text(&stat["value"]));
                let source = text(&stat["source"]);
                if !source.is_empty() {
                    let _ = write!(out, " ({source})");
                }
            }
            out.push_str("\n\n**Citations**");
            for citation in items(&value["citations"]) {
                let _ = write!(
                    out,
                    "\n- [{}]({})",
                    text(&citation["title"]),
                    text(&citation["url"])
                );
            }
        }
        "script" => {
            out.push_str("# Script\n\n**Beats**");
            for (i, beat) in items(&value["beats"]).into_iter().enumerate() {
                let _ = write!(out, "\n{}. {}", i + 1, text(beat));
            }
            let _ = write!(out, "\n\n**Summary**\n{}", text(&value["summary"]));
            let _ = write!(out, "\n\n**Draft**\n{}", text(&value["draft"]));
        }
        "thumbnail_prompts" => {
            out.push_str("# Thumbnail Prompts\n");
            for (i, prompt) in items(value).into_iter().enumerate() {
                let _ = write!(out, "\n{}. {}", i + 1, text(prompt));
            }
        }
        "captions" => {
            out.push_str("# Captions");
            for (field, heading) in [
                ("youtube", "YouTube"),
                ("tiktok", "TikTok"),
                ("instagram", "Instagram"),
            ] {
                bullets(&mut out, heading, &value[field]);
            }
            let tags: Vec<String> = items(&value["hashtags"])
                .into_iter()
                .map(|t| {
                    let t = text(t);
                    if t.starts_with('#') {
                        t
                    } else {
                        format!("#{t}")
                    }
                })
                .collect();
            let _ = write!(out, "\n\n**Hashtags**\n{}", tags.join(" "));
        }
        "voiceover" => {
            let _ = write!(out, "# Voiceover\n\n{}", text(&value["text"]));
            let voice = text(&value["voice_id"]);
            if !voice.is_empty() {
                let _ = write!(out, "\n\n_Voice: {voice}_");
            }
            let audio = text(&value["audio_path"]);
            if !audio.is_empty() {
                let _ = write!(out, "\n\n_Audio: {audio}_");
            }
        }
        "newsletter" => {
            out.push_str("# Newsletter");
            bullets(&mut out, "Subject Lines", &value["subjects"]);
            let _ = write!(out, "\n\n{}", text(&value["body"]));
        }
        other => {
            let _ = write!(out, "# {}\n\n", title_case(other));
            match value {
                Value::String(s) => out.push_str(s.trim()),
                v => {
                    let pretty = serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string());
                    let _ = write!(out, "```json\n{pretty}\n```");
                }
            }
        }
    }
    out
}

/// All present artifacts of a run, separated by rules.
pub fn run_markdown(state: &SessionState) -> String {
    let mut sections = Vec::new();
    if let Some(topic) = state.get_str(TOPIC_KEY) {
        sections.push(format!("**Topic:** {topic}"));
    }
    for key in ARTIFACT_ORDER {
        if let Some(value) = state.get(key) {
            sections.push(artifact_markdown(key, value));
        }
    }
    sections.join("\n\n---\n\n")
}

/// Flat `key.path -> text` view of the whole state. List items are indexed
/// as `key[0]`.
pub fn flatten_state(state: &SessionState) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    for (key, value) in state.values() {
        flatten_into(&mut flat, key.clone(), value);
    }
    flat
}

fn flatten_into(flat: &mut BTreeMap<String, String>, path: String, value: &Value) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                flatten_into(flat, format!("{path}.{k}"), v);
            }
        }
        Value::Array(list) if !list.is_empty() => {
            for (i, v) in list.iter().enumerate() {
                flatten_into(flat, format!("{path}[{i}]"), v);
            }
        }
        Value::String(s) => {
            flat.insert(path, s.clone());
        }
        other => {
            flat.insert(path, other.to_string());
        }
    }
}
