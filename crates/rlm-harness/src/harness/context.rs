//! Context payloads and the metadata retained about them.
//!
//! A context is a string, an ordered sequence of serializable items, or a
//! mapping of named fields. The payload itself goes to the worker; the run
//! keeps only metadata (type, sizes, and a bounded head preview of the
//! canonical serialization) so traces stay small no matter how large the
//! context is.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::redact::{preview, RedactionPolicy};

/// Item-length detail is compacted beyond this many entries.
const MAX_LISTED_LENGTHS: usize = 100;

/// A context payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextInput {
    Text(String),
    Items(Vec<Value>),
    Fields(serde_json::Map<String, Value>),
}

impl Default for ContextInput {
    fn default() -> Self {
        ContextInput::Text(String::new())
    }
}

impl ContextInput {
    pub fn kind(&self) -> &'static str {
        match self {
            ContextInput::Text(_) => "string",
            ContextInput::Items(_) => "list",
            ContextInput::Fields(_) => "mapping",
        }
    }

    /// The JSON value shipped to the worker's `init`.
    pub fn to_value(&self) -> Value {
        match self {
            ContextInput::Text(text) => Value::String(text.clone()),
            ContextInput::Items(items) => Value::Array(items.clone()),
            ContextInput::Fields(fields) => Value::Object(fields.clone()),
        }
    }

    /// Canonical serialization: the raw string for text, compact JSON for
    /// structured payloads.
    pub fn canonical(&self) -> String {
        match self {
            ContextInput::Text(text) => text.clone(),
            other => other.to_value().to_string(),
        }
    }

    fn item_lengths(&self) -> Vec<usize> {
        match self {
            ContextInput::Text(text) => vec![text.chars().count()],
            ContextInput::Items(items) => items
                .iter()
                .map(|item| serialized_len(item))
                .collect(),
            ContextInput::Fields(fields) => fields
                .values()
                .map(|value| serialized_len(value))
                .collect(),
        }
    }

    /// Metadata retained on the run.
    pub fn metadata(&self, policy: &RedactionPolicy) -> ContextMetadata {
        let canonical = self.canonical();
        let lengths = self.item_lengths();
        let item_count = lengths.len();
        let (preview_text, _) = preview(policy, &canonical);

        ContextMetadata {
            context_type: self.kind().to_string(),
            total_chars: canonical.chars().count(),
            item_count,
            item_lengths: ItemLengths::from(lengths),
            preview: preview_text,
        }
    }
}

fn serialized_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        other => other.to_string().chars().count(),
    }
}

/// Per-item length detail, compacted when the context has many items.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemLengths {
    Listed(Vec<usize>),
    #[serde(rename_all = "camelCase")]
    Compacted {
        count: usize,
        min: usize,
        max: usize,
        total: usize,
    },
}

impl From<Vec<usize>> for ItemLengths {
    fn from(lengths: Vec<usize>) -> Self {
        if lengths.len() <= MAX_LISTED_LENGTHS {
            return ItemLengths::Listed(lengths);
        }
        ItemLengths::Compacted {
            count: lengths.len(),
            min: lengths.iter().copied().min().unwrap_or(0),
            max: lengths.iter().copied().max().unwrap_or(0),
            total: lengths.iter().sum(),
        }
    }
}

/// What the run remembers about its context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMetadata {
    pub context_type: String,
    pub total_chars: usize,
    pub item_count: usize,
    pub item_lengths: ItemLengths,
    pub preview: String,
}

impl ContextMetadata {
    /// One-line length summary for prompt text.
    pub fn lengths_summary(&self) -> String {
        match &self.item_lengths {
            ItemLengths::Listed(lengths) => format!("{lengths:?}"),
            ItemLengths::Compacted {
                count,
                min,
                max,
                total,
            } => format!("{count} items, {min}..{max} chars each, {total} total"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_context_metadata() {
        let ctx = ContextInput::Text("hello world".into());
        let meta = ctx.metadata(&RedactionPolicy::default());
        assert_eq!(meta.context_type, "string");
        assert_eq!(meta.total_chars, 11);
        assert_eq!(meta.item_count, 1);
        assert_eq!(meta.preview, "hello world");
    }

    #[test]
    fn list_context_lengths_per_item() {
        let ctx = ContextInput::Items(vec!["ab".into(), "cdef".into()]);
        let meta = ctx.metadata(&RedactionPolicy::default());
        assert_eq!(meta.context_type, "list");
        assert_eq!(meta.item_count, 2);
        assert!(matches!(meta.item_lengths, ItemLengths::Listed(ref l) if l == &vec![2, 4]));
    }

    #[test]
    fn mapping_context_uses_field_values() {
        let mut fields = serde_json::Map::new();
        fields.insert("doc".into(), "text".into());
        fields.insert("meta".into(), serde_json::json!({"k": 1}));
        let ctx = ContextInput::Fields(fields);
        let meta = ctx.metadata(&RedactionPolicy::default());
        assert_eq!(meta.context_type, "mapping");
        assert_eq!(meta.item_count, 2);
    }

    #[test]
    fn many_items_compacted() {
        let items: Vec<Value> = (0..150).map(|i| Value::String("x".repeat(i % 7 + 1))).collect();
        let ctx = ContextInput::Items(items);
        let meta = ctx.metadata(&RedactionPolicy::default());
        match meta.item_lengths {
            ItemLengths::Compacted { count, min, max, .. } => {
                assert_eq!(count, 150);
                assert_eq!(min, 1);
                assert_eq!(max, 7);
            }
            ItemLengths::Listed(_) => panic!("expected compacted lengths"),
        }
    }

    #[test]
    fn long_context_preview_is_bounded() {
        let ctx = ContextInput::Text("z".repeat(100_000));
        let meta = ctx.metadata(&RedactionPolicy::default());
        assert!(meta.preview.chars().count() < 3_000);
        assert!(meta.preview.contains("more chars"));
    }

    #[test]
    fn untagged_deserialization() {
        let text: ContextInput = serde_json::from_str("\"plain\"").unwrap();
        assert!(matches!(text, ContextInput::Text(_)));

        let list: ContextInput = serde_json::from_str("[1, \"two\"]").unwrap();
        assert!(matches!(list, ContextInput::Items(_)));

        let map: ContextInput = serde_json::from_str("{\"a\": 1}").unwrap();
        assert!(matches!(map, ContextInput::Fields(_)));
    }
}
