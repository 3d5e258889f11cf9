//! Buffered reader over the backing process's output pipe
//!
//! The pipe carries unframed interactive text. Reads return whatever is
//! available up to a fixed window, decoded as UTF-8 with characters that
//! straddle two reads carried over instead of being dropped.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::time::Instant;

/// Result of one read against the output pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Decoded text. May be empty when the read ended inside a character.
    Text(String),
    /// End of stream. `tail` holds any bytes still pending decode.
    Closed { tail: String },
    /// The deadline passed before any bytes arrived.
    TimedOut,
}

pub struct OutputReader<R> {
    inner: BufReader<R>,
    window: usize,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputReader<R> {
    pub fn new(inner: R, window: usize) -> Self {
        let window = window.max(1);
        Self {
            inner: BufReader::with_capacity(window.max(4096), inner),
            window,
            pending: Vec::new(),
        }
    }

    /// Read the next chunk, giving up at `deadline` if one is set.
    ///
    /// Cancellation safe: a read abandoned at the deadline loses no bytes.
    pub async fn read_chunk(&mut self, deadline: Option<Instant>) -> io::Result<ReadOutcome> {
        let mut buf = vec![0u8; self.window];

        let read = match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, self.inner.read(&mut buf)).await {
                    Ok(read) => read?,
                    Err(_) => return Ok(ReadOutcome::TimedOut),
                }
            }
            None => self.inner.read(&mut buf).await?,
        };

        if read == 0 {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            return Ok(ReadOutcome::Closed { tail });
        }

        self.pending.extend_from_slice(&buf[..read]);
        Ok(ReadOutcome::Text(self.decode_pending()))
    }

    /// Decode as much of `pending` as possible, keeping an incomplete
    /// trailing sequence for the next read. Invalid bytes become U+FFFD.
    fn decode_pending(&mut self) -> String {
        let mut out = String::with_capacity(self.pending.len());
        let mut consumed = 0;

        while consumed < self.pending.len() {
            let rest = &self.pending[consumed..];
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    consumed = self.pending.len();
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid + bad;
                        }
                        None => {
                            consumed += valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..consumed);
        out
    }
}
