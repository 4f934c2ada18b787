//! Pull-based reader over an HTTP response body
//!
//! Yields each transport chunk as text, stopping as soon as the send's
//! cancellation signal fires.

use futures_util::{Stream, StreamExt};
use tokio::sync::watch;

/// Resolve once `cancel` reads `true`
///
/// If every sender has been dropped cancellation can no longer happen, so
/// the future stays pending.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Reads a byte stream chunk by chunk, decoding each chunk as UTF-8
pub struct StreamReader<S> {
    inner: S,
    cancel: watch::Receiver<bool>,
    /// Bytes of a UTF-8 sequence split across chunks
    carry: Vec<u8>,
    finished: bool,
    cancelled: bool,
}

impl<S, B, E> StreamReader<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    pub fn new(inner: S, cancel: watch::Receiver<bool>) -> Self {
        Self {
            inner,
            cancel,
            carry: Vec::new(),
            finished: false,
            cancelled: false,
        }
    }

    /// Whether reading stopped because of cancellation
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Read the next chunk of text
    ///
    /// Returns `None` when the body is exhausted or the send was cancelled.
    /// A transport error ends the stream after being returned once.
    pub async fn next_chunk(&mut self) -> Option<Result<String, E>> {
        if self.finished {
            return None;
        }
        if *self.cancel.borrow() {
            return self.stop_cancelled();
        }

        let cancel = &mut self.cancel;
        let inner = &mut self.inner;
        let next = tokio::select! {
            biased;
            _ = cancelled(cancel) => None,
            item = inner.next() => Some(item),
        };

        match next {
            None => self.stop_cancelled(),
            Some(None) => {
                self.finished = true;
                if self.carry.is_empty() {
                    None
                } else {
                    let rest = String::from_utf8_lossy(&self.carry).into_owned();
                    self.carry.clear();
                    Some(Ok(rest))
                }
            }
            Some(Some(Err(e))) => {
                self.finished = true;
                Some(Err(e))
            }
            Some(Some(Ok(bytes))) => Some(Ok(self.decode(bytes.as_ref()))),
        }
    }

    fn stop_cancelled(&mut self) -> Option<Result<String, E>> {
        log::debug!("Stream reading cancelled");
        self.finished = true;
        self.cancelled = true;
        None
    }

    /// Decode `bytes`, holding back an incomplete trailing UTF-8 sequence
    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(bytes);

        let mut text = String::with_capacity(buf.len());
        let mut rest: &[u8] = &buf;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }
}
