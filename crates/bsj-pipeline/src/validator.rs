//! Structured output validation.
//!
//! [`Validator::validate`] turns whatever a model returned into a normalized
//! payload matching a stage's [`OutputSchema`], or a one-line diagnostic that
//! can be fed back to the model. Malformed input is an expected outcome and is
//! reported as [`ValidationResult::Fail`]; nothing here panics or errors.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::schema::{Grounding, OutputSchema, Shape, UnknownKeyPolicy};
use bsj_types::StateView;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("fence pattern is valid")
});

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9]+").expect("word pattern is valid"));

/// Vocabulary that signals the model drifted into sports coverage.
const DRIFT_TERMS: &[&str] = &[
    "celtics", "heat", "nba", "playoffs", "season", "fenway", "patriots", "bruins", "redsox",
    "boston",
];

/// What an agent invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    Text(String),
    Structured(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Pass(Value),
    Fail(String),
}

impl ValidationResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, ValidationResult::Pass(_))
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            ValidationResult::Pass(v) => Some(v),
            ValidationResult::Fail(_) => None,
        }
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            ValidationResult::Pass(_) => None,
            ValidationResult::Fail(d) => Some(d),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Validator {
    unknown_keys: UnknownKeyPolicy,
}

impl Validator {
    pub fn new(unknown_keys: UnknownKeyPolicy) -> Self {
        Self { unknown_keys }
    }

    /// Validate `raw` against `schema`. `context` is the stage's input view,
    /// consulted only by the grounding check.
    pub fn validate(
        &self,
        raw: &RawOutput,
        schema: &OutputSchema,
        context: &StateView,
    ) -> ValidationResult {
        let value = match raw {
            RawOutput::Structured(v) => v.clone(),
            RawOutput::Text(text) if text.trim().is_empty() => {
                return ValidationResult::Fail("response was empty".into())
            }
            RawOutput::Text(text) if schema.is_text() => Value::String(text.trim().to_string()),
            RawOutput::Text(text) => match extract_json_preferring(text, preferred_opener(schema)) {
                Some(v) => v,
                None => {
                    return ValidationResult::Fail(
                        "no JSON object or array found in response".into(),
                    )
                }
            },
        };

        let value = unwrap_envelope(value, schema);
        let mut diagnostics = Vec::new();
        let normalized = normalize(value, &schema.shape, "", self.unknown_keys, &mut diagnostics);
        if !diagnostics.is_empty() {
            return ValidationResult::Fail(diagnostics.join("; "));
        }

        if let Some(grounding) = &schema.grounding {
            if let Some(diagnostic) = check_grounding(&normalized, grounding, context) {
                return ValidationResult::Fail(diagnostic);
            }
        }

        ValidationResult::Pass(normalized)
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Regions of `text` worth searching, in order: every closed fenced block,
/// a trailing unterminated fence (the response was cut off), then the text
/// itself.
fn search_regions(text: &str) -> Vec<&str> {
    let mut regions: Vec<&str> = FENCED_BLOCK
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|body| body.as_str())
        .collect();
    if regions.is_empty() {
        let trimmed = text.trim_start();
        if trimmed.starts_with("```") {
            regions.push(trimmed.split_once('\n').map(|(_, rest)| rest).unwrap_or(""));
        }
    }
    regions.push(text);
    regions
}

/// Byte length of the balanced JSON value starting at `text[0]`.
fn balanced_len(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// Top-level JSON values found in `region`: the whole region, then each
/// balanced span that parses (skipping openers nested inside a parsed one),
/// then first-opener-to-last-closer.
fn candidates(region: &str) -> Vec<Value> {
    let body = region.trim();
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        if v.is_object() || v.is_array() {
            return vec![v];
        }
    }

    let mut found = Vec::new();
    let mut offset = 0;
    while let Some(rel) = body[offset..].find(['{', '[']) {
        let start = offset + rel;
        let candidate = &body[start..];
        match balanced_len(candidate).map(|len| (len, serde_json::from_str::<Value>(&candidate[..len]))) {
            Some((len, Ok(v))) => {
                found.push(v);
                offset = start + len;
            }
            _ => offset = start + 1,
        }
    }

    if found.is_empty() {
        if let Some(start) = body.find(['{', '[']) {
            let candidate = &body[start..];
            let closer = if candidate.starts_with('{') { '}' } else { ']' };
            if let Some(end) = candidate.rfind(closer) {
                if let Ok(v) = serde_json::from_str(&candidate[..=end]) {
                    found.push(v);
                }
            }
        }
    }
    found
}

/// Locate a JSON object or array inside free text, trying every fenced block
/// before the surrounding prose.
pub fn extract_json(text: &str) -> Option<Value> {
    extract_json_preferring(text, None)
}

/// Like [`extract_json`], but a value whose top level is `preferred` (`{` or
/// `[`) wins over an earlier one of the other kind.
fn extract_json_preferring(text: &str, preferred: Option<char>) -> Option<Value> {
    let mut fallback = None;
    for region in search_regions(text) {
        for value in candidates(region) {
            let wanted = match preferred {
                Some('{') => value.is_object(),
                Some('[') => value.is_array(),
                _ => true,
            };
            if wanted {
                return Some(value);
            }
            fallback.get_or_insert(value);
        }
    }
    fallback
}

/// The top-level JSON kind a schema expects, when only one makes sense.
fn preferred_opener(schema: &OutputSchema) -> Option<char> {
    match (&schema.shape, &schema.envelope) {
        (Shape::Object(_), _) => Some('{'),
        (Shape::List { .. }, None) => Some('['),
        _ => None,
    }
}

fn unwrap_envelope(value: Value, schema: &OutputSchema) -> Value {
    let Some(envelope) = &schema.envelope else {
        return value;
    };
    let shadowed = matches!(&schema.shape, Shape::Object(fields) if fields.iter().any(|f| &f.name == envelope));
    match value {
        Value::Object(mut map) if !shadowed && map.contains_key(envelope) => {
            map.remove(envelope).unwrap_or(Value::Null)
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn child_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "top level"
    } else {
        path
    }
}

/// Models sometimes return a structure serialized as a string.
fn reparse(value: Value) -> Value {
    match value {
        Value::String(s) if s.trim_start().starts_with(['{', '[']) => {
            serde_json::from_str(&s).unwrap_or(Value::String(s))
        }
        other => other,
    }
}

fn normalize(
    value: Value,
    shape: &Shape,
    path: &str,
    policy: UnknownKeyPolicy,
    diagnostics: &mut Vec<String>,
) -> Value {
    match shape {
        Shape::Any => value,
        Shape::Text { min_len } => {
            let text = match value {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    diagnostics.push(format!(
                        "expected a string at '{}', found {}",
                        display_path(path),
                        kind(&other)
                    ));
                    return other;
                }
            };
            let len = text.trim().chars().count();
            if len < *min_len {
                diagnostics.push(format!(
                    "'{}' is too short ({len} < {min_len} chars)",
                    display_path(path)
                ));
            }
            Value::String(text)
        }
        Shape::List { item, min_items } => {
            let items = match reparse(value) {
                Value::Array(items) => items,
                Value::String(s) => vec![Value::String(s)],
                other => {
                    diagnostics.push(format!(
                        "expected a list at '{}', found {}",
                        display_path(path),
                        kind(&other)
                    ));
                    return other;
                }
            };
            let normalized: Vec<Value> = items
                .into_iter()
                .enumerate()
                .map(|(i, v)| normalize(v, item, &format!("{path}[{i}]"), policy, diagnostics))
                .collect();
            if normalized.len() < *min_items {
                diagnostics.push(format!(
                    "expected at least {min_items} items at '{}', found {}",
                    display_path(path),
                    normalized.len()
                ));
            }
            Value::Array(normalized)
        }
        Shape::Object(fields) => {
            let mut map = match reparse(value) {
                Value::Object(map) => map,
                other => {
                    diagnostics.push(format!(
                        "expected a JSON object at '{}', found {}",
                        display_path(path),
                        kind(&other)
                    ));
                    return other;
                }
            };
            let mut out = Map::new();
            for field in fields {
                let key = child_path(path, &field.name);
                let present = map
                    .remove(&field.name)
                    .filter(|v| !v.is_null())
                    .filter(|v| field.required || *v != field.default_value());
                match present {
                    Some(v) => {
                        let v = normalize(v, &field.shape, &key, policy, diagnostics);
                        out.insert(field.name.clone(), v);
                    }
                    None if field.required => {
                        diagnostics.push(format!("expected JSON key '{key}' missing"));
                    }
                    None => {
                        out.insert(field.name.clone(), field.default_value());
                    }
                }
            }
            if policy == UnknownKeyPolicy::Report && !map.is_empty() {
                let extra: Vec<String> = map.keys().map(|k| format!("'{k}'")).collect();
                diagnostics.push(format!(
                    "unexpected key(s) {} at '{}'",
                    extra.join(", "),
                    display_path(path)
                ));
            }
            Value::Object(out)
        }
    }
}

// ---------------------------------------------------------------------------
// Grounding
// ---------------------------------------------------------------------------

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    WORD.find_iter(text).map(|m| m.as_str().to_string())
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, key| v.get(key))
}

/// Keywords a grounded text should mention: topic words of 4+ chars and
/// research-topic words of 5+ chars.
pub fn topic_keywords(topic: &str, research: Option<&Value>) -> BTreeSet<String> {
    let mut keywords: BTreeSet<String> = words(&topic.to_lowercase())
        .filter(|w| w.chars().count() >= 4)
        .collect();
    let research_topics = research
        .and_then(|r| r.get("topics"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for t in research_topics {
        keywords.extend(words(&t.to_lowercase()).filter(|w| w.chars().count() >= 5));
    }
    keywords
}

fn check_grounding(payload: &Value, grounding: &Grounding, context: &StateView) -> Option<String> {
    let field = &grounding.field;
    let text = lookup(payload, field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    if text.trim().is_empty() {
        return Some(format!("'{field}' is empty"));
    }

    let topic = context
        .get_str(&grounding.topic_key)
        .unwrap_or_default()
        .to_lowercase();
    let topic_words: BTreeSet<String> = words(&topic).collect();
    if !DRIFT_TERMS.iter().any(|t| topic_words.contains(*t)) {
        let text_words: BTreeSet<String> = words(&text).collect();
        if let Some(term) = DRIFT_TERMS.iter().find(|t| text_words.contains(**t)) {
            return Some(format!(
                "'{field}' drifts into an unrelated domain (mentions '{term}'); stay on the topic"
            ));
        }
    }

    let keywords = topic_keywords(&topic, context.get(&grounding.research_key));
    if keywords.is_empty() || keywords.iter().any(|k| text.contains(k.as_str())) {
        return None;
    }
    let sample: Vec<&str> = keywords.iter().take(5).map(String::as_str).collect();
    Some(format!(
        "'{field}' appears off-topic: none of [{}] is mentioned",
        sample.join(", ")
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
