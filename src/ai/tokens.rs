//! Token counting for request/response accounting

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn encoder() -> Option<&'static CoreBPE> {
    ENCODER
        .get_or_init(|| match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                log::warn!("Failed to load cl100k tokenizer, using estimate: {}", e);
                None
            }
        })
        .as_ref()
}

/// Count tokens in `text` with the cl100k encoding
///
/// Falls back to a four-characters-per-token estimate if the encoding
/// cannot be loaded.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    match encoder() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}
