//! Parser for single lines of the tools-augmented data stream
//!
//! A line is one of:
//! - a JSON envelope `{"text": "...", "data": ...}` (both optional)
//! - a JSON string, which is text
//! - a JSON array, which is data
//! - a prefixed stream part: `0:` text, `2:`/`8:` data, `3:` error
//! - anything else, which is plain text

use serde_json::Value;
use thiserror::Error;

/// A streamed line that could not be decoded
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Malformed JSON line: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unexpected record: {0}")]
    Unexpected(String),
}

/// One decoded data-stream line
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataStreamRecord {
    pub text: String,
    pub data: Option<Value>,
}

impl DataStreamRecord {
    fn text(text: String) -> Self {
        Self { text, data: None }
    }

    fn data(data: Value) -> Self {
        Self {
            text: String::new(),
            data: non_null(data),
        }
    }
}

fn non_null(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        other => Some(other),
    }
}

fn looks_like_json(s: &str) -> bool {
    matches!(s.as_bytes().first(), Some(b'{') | Some(b'[') | Some(b'"'))
}

/// Parse one non-blank line
///
/// Returns `Ok(None)` for lines that carry nothing for the transcript, such
/// as error parts, which are logged here.
pub fn parse_record(line: &str) -> Result<Option<DataStreamRecord>, DecodeError> {
    let line = line.trim_end_matches('\r');

    if let Some((code, payload)) = line.split_once(':') {
        if matches!(code, "0" | "2" | "3" | "8") && looks_like_json(payload) {
            return parse_part(code, payload);
        }
    }

    if !looks_like_json(line) {
        return Ok(Some(DataStreamRecord::text(line.to_string())));
    }

    match serde_json::from_str::<Value>(line)? {
        Value::Object(mut envelope) => {
            let text = match envelope.remove("text") {
                Some(Value::String(text)) => text,
                Some(Value::Null) | None => String::new(),
                Some(other) => {
                    return Err(DecodeError::Unexpected(format!(
                        "text field is not a string: {}",
                        other
                    )))
                }
            };
            let data = envelope.remove("data").and_then(non_null);
            Ok(Some(DataStreamRecord { text, data }))
        }
        Value::String(text) => Ok(Some(DataStreamRecord::text(text))),
        data @ Value::Array(_) => Ok(Some(DataStreamRecord::data(data))),
        other => Err(DecodeError::Unexpected(other.to_string())),
    }
}

fn parse_part(code: &str, payload: &str) -> Result<Option<DataStreamRecord>, DecodeError> {
    let value: Value = serde_json::from_str(payload)?;
    match code {
        "0" => match value {
            Value::String(text) => Ok(Some(DataStreamRecord::text(text))),
            other => Err(DecodeError::Unexpected(format!(
                "text part is not a string: {}",
                other
            ))),
        },
        "2" | "8" => Ok(Some(DataStreamRecord::data(value))),
        _ => {
            log::warn!("Data stream reported an error: {}", value);
            Ok(None)
        }
    }
}
