//! Streaming response pipeline
//!
//! [`IncrementStream`] pulls raw chunks through a [`StreamReader`] and turns
//! them into [`DecodedIncrement`]s with a [`ResponseDecoder`]. It is lazy,
//! finite and not restartable; dropping it or firing the cancel signal ends
//! the sequence.

mod data_stream;
mod decoder;
mod reader;

pub use data_stream::{parse_record, DataStreamRecord, DecodeError};
pub use decoder::{DecodedIncrement, Dialect, ResponseDecoder};
pub use reader::StreamReader;
pub(crate) use reader::cancelled;

use futures_util::Stream;
use std::collections::VecDeque;
use tokio::sync::watch;

/// Pull-based sequence of decoded increments over a response body
pub struct IncrementStream<S> {
    reader: StreamReader<S>,
    decoder: ResponseDecoder,
    queue: VecDeque<DecodedIncrement>,
    flushed: bool,
}

impl<S, B, E> IncrementStream<S>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
{
    pub fn new(body: S, dialect: Dialect, cancel: watch::Receiver<bool>) -> Self {
        Self {
            reader: StreamReader::new(body, cancel),
            decoder: ResponseDecoder::new(dialect),
            queue: VecDeque::new(),
            flushed: false,
        }
    }

    /// Next increment, `None` once the body ends or the send is cancelled
    ///
    /// Increments already decoded from a chunk are still returned after a
    /// cancellation fires; no new chunk is read.
    pub async fn next(&mut self) -> Option<Result<DecodedIncrement, E>> {
        loop {
            if let Some(increment) = self.queue.pop_front() {
                return Some(Ok(increment));
            }
            if self.flushed {
                return None;
            }

            match self.reader.next_chunk().await {
                Some(Ok(chunk)) => self.queue.extend(self.decoder.decode(&chunk)),
                Some(Err(e)) => {
                    self.flushed = true;
                    return Some(Err(e));
                }
                None => {
                    self.flushed = true;
                    if !self.reader.was_cancelled() {
                        self.queue.extend(self.decoder.finish());
                    }
                }
            }
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.reader.was_cancelled()
    }
}
