//! Response decoding for the three backend dialects
//!
//! - Hosted providers stream raw text; each chunk is content.
//! - The local runner streams newline-delimited `{"message":{"content":...}}`
//!   objects, possibly several per chunk and possibly split across chunks.
//! - Tools-augmented endpoints stream newline-delimited data-stream records
//!   carrying text and annotation data.

use serde::Deserialize;

use super::data_stream::parse_record;
use crate::ai::annotation::Annotation;

/// Wire format of a response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    PlainText,
    LocalRunner,
    DataStream,
}

/// Normalized unit consumed by the conversation state updater
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedIncrement {
    pub text: String,
    /// Replaces the running annotation when present
    pub annotation: Option<Annotation>,
}

impl DecodedIncrement {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            annotation: None,
        }
    }

    /// Carries neither text nor annotation
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.annotation.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct LocalChunk {
    #[serde(default)]
    message: Option<LocalMessage>,
}

#[derive(Debug, Deserialize)]
struct LocalMessage {
    #[serde(default)]
    content: String,
}

/// Stateful decoder for one response body
#[derive(Debug)]
pub struct ResponseDecoder {
    dialect: Dialect,
    /// Text after the last newline, waiting for the rest of its line
    pending: String,
}

impl ResponseDecoder {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            pending: String::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Decode one transport chunk
    ///
    /// Always returns at least one increment; an empty increment means the
    /// chunk arrived but nothing is ready to render yet.
    pub fn decode(&mut self, chunk: &str) -> Vec<DecodedIncrement> {
        let increments = match self.dialect {
            Dialect::PlainText => vec![DecodedIncrement::text(chunk)],
            Dialect::LocalRunner => {
                let lines = self.take_complete_lines(chunk);
                vec![decode_local_lines(&lines)]
            }
            Dialect::DataStream => {
                let lines = self.take_complete_lines(chunk);
                decode_data_lines(&lines)
            }
        };

        if increments.is_empty() {
            vec![DecodedIncrement::default()]
        } else {
            increments
        }
    }

    /// Flush whatever is left once the body ends
    pub fn finish(&mut self) -> Vec<DecodedIncrement> {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() {
            return Vec::new();
        }

        match self.dialect {
            Dialect::PlainText => vec![DecodedIncrement::text(rest)],
            Dialect::LocalRunner => {
                let increment = decode_local_lines(&rest);
                if increment.is_empty() {
                    Vec::new()
                } else {
                    vec![increment]
                }
            }
            Dialect::DataStream => decode_data_lines(&rest),
        }
    }

    /// Append `chunk` to the pending buffer and split off every complete line
    fn take_complete_lines(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        match self.pending.rfind('\n') {
            Some(pos) => {
                let rest = self.pending.split_off(pos + 1);
                std::mem::replace(&mut self.pending, rest)
            }
            None => String::new(),
        }
    }
}

fn decode_local_lines(lines: &str) -> DecodedIncrement {
    let mut text = String::new();
    for line in lines.split('\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LocalChunk>(line) {
            Ok(LocalChunk {
                message: Some(message),
            }) => text.push_str(&message.content),
            Ok(LocalChunk { message: None }) => {}
            Err(e) => log::warn!("Skipping malformed local runner line ({}): {}", e, line),
        }
    }
    DecodedIncrement::text(text)
}

fn decode_data_lines(lines: &str) -> Vec<DecodedIncrement> {
    lines
        .split('\n')
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match parse_record(line) {
            Ok(Some(record)) => Some(DecodedIncrement {
                text: record.text,
                annotation: record.data.map(Annotation::from),
            }),
            Ok(None) => None,
            Err(e) => {
                log::warn!("Skipping malformed data stream line ({}): {}", e, line);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Feed chunks and fold increments the way the updater does
    fn decode_all(dialect: Dialect, chunks: &[&str]) -> (String, Option<Annotation>) {
        let mut decoder = ResponseDecoder::new(dialect);
        let mut text = String::new();
        let mut annotation = None;
        let mut apply = |increments: Vec<DecodedIncrement>| {
            for inc in increments {
                text.push_str(&inc.text);
                if inc.annotation.is_some() {
                    annotation = inc.annotation;
                }
            }
        };
        for chunk in chunks {
            apply(decoder.decode(chunk));
        }
        apply(decoder.finish());
        (text, annotation)
    }

    fn split_every_char(payload: &str) -> Vec<String> {
        payload.chars().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_hosted_two_chunks() {
        let (text, annotation) = decode_all(Dialect::PlainText, &["Hel", "lo"]);
        assert_eq!(text, "Hello");
        assert!(annotation.is_none());
    }

    #[test]
    fn test_local_single_object() {
        let (text, _) = decode_all(
            Dialect::LocalRunner,
            &["{\"message\":{\"content\":\"Hi\"}}\n"],
        );
        assert_eq!(text, "Hi");
    }

    #[test]
    fn test_local_multiple_objects_in_one_chunk() {
        let mut decoder = ResponseDecoder::new(Dialect::LocalRunner);
        let increments = decoder.decode(
            "{\"message\":{\"content\":\"Hel\"}}\n{\"message\":{\"content\":\"lo\"}}\n",
        );
        assert_eq!(increments, vec![DecodedIncrement::text("Hello")]);
    }

    #[test]
    fn test_local_partial_line_is_held() {
        let mut decoder = ResponseDecoder::new(Dialect::LocalRunner);

        let first = decoder.decode("{\"message\":{\"content\":\"A\"}}\n{\"message\":{\"con");
        assert_eq!(first, vec![DecodedIncrement::text("A")]);

        let second = decoder.decode("tent\":\"B\"}}\n");
        assert_eq!(second, vec![DecodedIncrement::text("B")]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn test_local_done_record_and_unterminated_tail() {
        let (text, _) = decode_all(
            Dialect::LocalRunner,
            &[
                "{\"message\":{\"content\":\"x\"}}\n",
                "{\"done\":true}",
            ],
        );
        assert_eq!(text, "x");

        let (text, _) = decode_all(Dialect::LocalRunner, &["{\"message\":{\"content\":\"tail\"}}"]);
        assert_eq!(text, "tail");
    }

    #[test]
    fn test_local_malformed_line_is_skipped() {
        let (text, _) = decode_all(
            Dialect::LocalRunner,
            &["not json\n{\"message\":{\"content\":\"ok\"}}\n"],
        );
        assert_eq!(text, "ok");
    }

    #[test]
    fn test_tools_scenario_last_annotation_wins() {
        let (text, annotation) = decode_all(
            Dialect::DataStream,
            &["{\"text\":\"A\",\"data\":{\"x\":1}}\n", "{\"text\":\"B\"}\n"],
        );
        assert_eq!(text, "AB");
        assert_eq!(annotation.unwrap().to_value(), json!({"x": 1}));
    }

    #[test]
    fn test_tools_later_annotation_replaces_not_merges() {
        let (_, annotation) = decode_all(
            Dialect::DataStream,
            &["{\"data\":{\"a\":1}}\n{\"data\":{\"b\":2}}\n"],
        );
        assert_eq!(annotation.unwrap().to_value(), json!({"b": 2}));
    }

    #[test]
    fn test_tools_multiple_lines_yield_multiple_increments() {
        let mut decoder = ResponseDecoder::new(Dialect::DataStream);
        let increments = decoder.decode("{\"text\":\"A\"}\n\n{\"text\":\"B\"}\n");
        assert_eq!(increments.len(), 2);
        assert_eq!(increments[0].text, "A");
        assert_eq!(increments[1].text, "B");
    }

    #[test]
    fn test_tools_buffers_until_newline() {
        let mut decoder = ResponseDecoder::new(Dialect::DataStream);
        let first = decoder.decode("{\"text\":");
        assert_eq!(first, vec![DecodedIncrement::default()]);
        assert!(first[0].is_empty());

        let second = decoder.decode("\"A\"}\n");
        assert_eq!(second, vec![DecodedIncrement::text("A")]);
    }

    #[test]
    fn test_tools_malformed_line_does_not_abort() {
        let (text, _) = decode_all(
            Dialect::DataStream,
            &["{\"text\":\"A\"\n{\"text\":\"B\"}\n"],
        );
        assert_eq!(text, "B");
    }

    #[test]
    fn test_tools_tail_flushed_at_end() {
        let (text, _) = decode_all(Dialect::DataStream, &["{\"text\":\"A\"}\n{\"text\":\"Z\"}"]);
        assert_eq!(text, "AZ");
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_result() {
        let cases = [
            (Dialect::PlainText, "The quick brown fox"),
            (
                Dialect::LocalRunner,
                "{\"message\":{\"content\":\"The \"}}\n{\"message\":{\"content\":\"fox\"}}\n",
            ),
            (
                Dialect::DataStream,
                "{\"text\":\"The \",\"data\":{\"k\":[1,2]}}\n\n{\"text\":\"fox\"}\n",
            ),
        ];

        for (dialect, payload) in cases {
            let whole = decode_all(dialect, &[payload]);
            let pieces = split_every_char(payload);
            let refs: Vec<&str> = pieces.iter().map(String::as_str).collect();
            let split = decode_all(dialect, &refs);
            assert_eq!(whole, split, "dialect {:?}", dialect);

            let (head, tail) = payload.split_at(payload.len() / 2);
            let halves = decode_all(dialect, &[head, tail]);
            assert_eq!(whole, halves, "dialect {:?}", dialect);
        }
    }

    #[test]
    fn test_every_chunk_produces_an_increment() {
        let mut decoder = ResponseDecoder::new(Dialect::LocalRunner);
        assert_eq!(decoder.decode("{\"mess").len(), 1);
        assert_eq!(decoder.decode("").len(), 1);
    }
}
