//! Structured side-channel data attached to assistant turns
//!
//! Tools-augmented responses interleave plain text with data records. A
//! record's payload is an object keyed by tool name (or an array of such
//! objects), and each tool stores its own result shape under its key.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const IMAGE_GENERATOR_KEY: &str = "imageGenerator__generateImage";
pub const GOOGLE_SEARCH_KEY: &str = "webScraper__googleSearch";
pub const YOUTUBE_CAPTIONS_KEY: &str = "webScraper__youtubeCaptions";
pub const TOOL_CALLS_KEY: &str = "toolCalls";

/// Key used when a data record is not an object
const RAW_DATA_KEY: &str = "data";

/// Fields every tool-specific result may carry
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolPayload {
    /// Seconds the tool took to run
    pub response_time: Option<f64>,
    /// Output should not be counted toward response tokens
    pub skip_token_count: bool,
    /// Tool-specific fields, kept verbatim
    pub fields: Map<String, Value>,
}

impl ToolPayload {
    fn from_object(mut fields: Map<String, Value>) -> Self {
        let response_time = fields.get("responseTime").and_then(Value::as_f64);
        let skip_token_count = fields
            .get("skipTokenCount")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        fields.remove("responseTime");
        fields.remove("skipTokenCount");
        Self {
            response_time,
            skip_token_count,
            fields,
        }
    }

    fn to_value(&self) -> Value {
        let mut fields = self.fields.clone();
        if let Some(response_time) = self.response_time {
            fields.insert("responseTime".to_string(), Value::from(response_time));
        }
        if self.skip_token_count {
            fields.insert("skipTokenCount".to_string(), Value::Bool(true));
        }
        Value::Object(fields)
    }
}

/// Result of one augmentation tool, discriminated by its annotation key
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    ImageGeneration(ToolPayload),
    WebSearch(ToolPayload),
    YoutubeCaptions(ToolPayload),
    ToolCalls(Value),
    Other(Value),
}

impl ToolResult {
    fn from_entry(key: &str, value: Value) -> Self {
        match (key, value) {
            (IMAGE_GENERATOR_KEY, Value::Object(fields)) => {
                ToolResult::ImageGeneration(ToolPayload::from_object(fields))
            }
            (GOOGLE_SEARCH_KEY, Value::Object(fields)) => {
                ToolResult::WebSearch(ToolPayload::from_object(fields))
            }
            (YOUTUBE_CAPTIONS_KEY, Value::Object(fields)) => {
                ToolResult::YoutubeCaptions(ToolPayload::from_object(fields))
            }
            (TOOL_CALLS_KEY, value) => ToolResult::ToolCalls(value),
            (_, value) => ToolResult::Other(value),
        }
    }

    fn to_value(&self) -> Value {
        match self {
            ToolResult::ImageGeneration(payload)
            | ToolResult::WebSearch(payload)
            | ToolResult::YoutubeCaptions(payload) => payload.to_value(),
            ToolResult::ToolCalls(value) | ToolResult::Other(value) => value.clone(),
        }
    }

    pub fn payload(&self) -> Option<&ToolPayload> {
        match self {
            ToolResult::ImageGeneration(payload)
            | ToolResult::WebSearch(payload)
            | ToolResult::YoutubeCaptions(payload) => Some(payload),
            ToolResult::ToolCalls(_) | ToolResult::Other(_) => None,
        }
    }

    /// Whether this result asks to be excluded from token accounting
    pub fn skips_token_count(&self) -> bool {
        match self {
            ToolResult::ToolCalls(value) | ToolResult::Other(value) => value
                .get("skipTokenCount")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            _ => self.payload().map(|p| p.skip_token_count).unwrap_or(false),
        }
    }
}

/// Open map of tool name to tool result
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct Annotation {
    entries: BTreeMap<String, ToolResult>,
}

impl Annotation {
    /// Build an annotation from a streamed data payload
    ///
    /// Objects map key-for-key. Arrays of objects are merged left to right, a
    /// later key replacing an earlier one. Returns `None` for `null` and for
    /// payloads that carry no entries.
    pub fn from_value(value: Value) -> Option<Self> {
        let mut entries = BTreeMap::new();
        match value {
            Value::Null => return None,
            Value::Object(map) => {
                for (key, value) in map {
                    let result = ToolResult::from_entry(&key, value);
                    entries.insert(key, result);
                }
            }
            Value::Array(items) => {
                for item in items {
                    match item {
                        Value::Object(map) => {
                            for (key, value) in map {
                                let result = ToolResult::from_entry(&key, value);
                                entries.insert(key, result);
                            }
                        }
                        Value::Null => {}
                        other => {
                            entries.insert(RAW_DATA_KEY.to_string(), ToolResult::Other(other));
                        }
                    }
                }
            }
            other => {
                entries.insert(RAW_DATA_KEY.to_string(), ToolResult::Other(other));
            }
        }

        if entries.is_empty() {
            None
        } else {
            Some(Self { entries })
        }
    }

    pub fn get(&self, key: &str) -> Option<&ToolResult> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ToolResult)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when any tool result flags `skipTokenCount`
    pub fn skips_token_count(&self) -> bool {
        self.entries.values().any(ToolResult::skips_token_count)
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_value()))
                .collect(),
        )
    }
}

impl From<Value> for Annotation {
    fn from(value: Value) -> Self {
        Annotation::from_value(value).unwrap_or_default()
    }
}

impl From<Annotation> for Value {
    fn from(annotation: Annotation) -> Self {
        annotation.to_value()
    }
}

/// Display label for the response time of a known tool
pub fn response_time_label(key: &str) -> Option<&'static str> {
    match key {
        IMAGE_GENERATOR_KEY => Some("Image"),
        YOUTUBE_CAPTIONS_KEY => Some("YouTube"),
        GOOGLE_SEARCH_KEY => Some("Google Search"),
        _ => None,
    }
}
