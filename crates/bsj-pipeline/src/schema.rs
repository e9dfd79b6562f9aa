//! Declarative output schemas for agent stages.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Expected shape of a value inside a stage's output.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// A string with at least `min_len` non-whitespace-trimmed characters.
    /// Numbers and booleans are accepted and rendered as strings.
    Text { min_len: usize },
    /// Anything, passed through untouched.
    Any,
    List { item: Box<Shape>, min_items: usize },
    Object(Vec<FieldSpec>),
}

impl Shape {
    pub fn text() -> Self {
        Shape::Text { min_len: 0 }
    }

    pub fn text_min(min_len: usize) -> Self {
        Shape::Text { min_len }
    }

    pub fn list_of(item: Shape, min_items: usize) -> Self {
        Shape::List {
            item: Box::new(item),
            min_items,
        }
    }

    pub fn object(fields: Vec<FieldSpec>) -> Self {
        Shape::Object(fields)
    }

    /// Value used for an optional field the model left out.
    pub fn default_value(&self) -> Value {
        match self {
            Shape::Text { .. } => Value::String(String::new()),
            Shape::Any => Value::Null,
            Shape::List { .. } => Value::Array(Vec::new()),
            Shape::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|f| (f.name.clone(), f.default_value()))
                    .collect(),
            ),
        }
    }

    /// Compact template shown to the model, e.g. `{"beats": ["string (>= 3 items)"]}`.
    pub fn describe(&self) -> Value {
        match self {
            Shape::Text { min_len: 0 } => json!("string"),
            Shape::Text { min_len } => json!(format!("string (>= {min_len} chars)")),
            Shape::Any => json!("any"),
            Shape::List { item, min_items } => {
                let mut inner = item.describe();
                if *min_items > 0 {
                    if let Value::String(s) = &inner {
                        inner = json!(format!("{s}; list of >= {min_items} items"));
                    } else {
                        return json!([inner, format!(">= {min_items} items")]);
                    }
                }
                json!([inner])
            }
            Shape::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|f| {
                        let key = if f.required {
                            f.name.clone()
                        } else {
                            format!("{}?", f.name)
                        };
                        (key, f.shape.describe())
                    })
                    .collect(),
            ),
        }
    }
}

/// One named field of an object shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub shape: Shape,
    pub required: bool,
    pub default: Option<Value>,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, shape: Shape) -> Self {
        Self {
            name: name.into(),
            shape,
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn default_value(&self) -> Value {
        self.default
            .clone()
            .unwrap_or_else(|| self.shape.default_value())
    }
}

/// What to do with object keys the schema does not name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownKeyPolicy {
    #[default]
    Drop,
    Report,
}

/// Topic-grounding check applied to one text field of the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Grounding {
    /// Dotted path inside the normalized payload, e.g. `draft` or `text`.
    pub field: String,
    /// State key holding the run topic.
    pub topic_key: String,
    /// State key holding research findings with a `topics` list.
    pub research_key: String,
}

/// Contract for a stage's structured output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub shape: Shape,
    /// Wrapper key the model may nest the payload under (`{"script": {...}}`).
    pub envelope: Option<String>,
    pub grounding: Option<Grounding>,
}

impl OutputSchema {
    pub fn new(shape: Shape) -> Self {
        Self {
            shape,
            envelope: None,
            grounding: None,
        }
    }

    pub fn with_envelope(mut self, key: impl Into<String>) -> Self {
        self.envelope = Some(key.into());
        self
    }

    pub fn grounded_on(
        mut self,
        field: impl Into<String>,
        topic_key: impl Into<String>,
        research_key: impl Into<String>,
    ) -> Self {
        self.grounding = Some(Grounding {
            field: field.into(),
            topic_key: topic_key.into(),
            research_key: research_key.into(),
        });
        self
    }

    /// `true` when the payload is free text rather than JSON.
    pub fn is_text(&self) -> bool {
        matches!(self.shape, Shape::Text { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_shape() {
        let shape = Shape::object(vec![
            FieldSpec::required("text", Shape::text_min(1)),
            FieldSpec::optional("voice_id", Shape::Any),
            FieldSpec::optional("tags", Shape::list_of(Shape::text(), 0)),
        ]);
        assert_eq!(
            shape.default_value(),
            json!({"text": "", "voice_id": null, "tags": []})
        );
        let field = FieldSpec::optional("lang", Shape::text()).with_default(json!("en"));
        assert_eq!(field.default_value(), json!("en"));
    }

    #[test]
    fn describe_marks_optional_and_minimums() {
        let shape = Shape::object(vec![
            FieldSpec::required("beats", Shape::list_of(Shape::text(), 3)),
            FieldSpec::optional("voice_id", Shape::text()),
        ]);
        let described = shape.describe();
        assert_eq!(described["beats"], json!(["string; list of >= 3 items"]));
        assert_eq!(described["voice_id?"], json!("string"));
    }
}
