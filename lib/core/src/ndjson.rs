//! Newline-delimited JSON framing.
//!
//! Every record is one compact JSON document followed by `\n`. Transports are
//! free to split or coalesce records at arbitrary byte boundaries, so the
//! receiving side runs a [`LineDecoder`]: bytes are accumulated, complete
//! lines are split off on the delimiter and parsed independently, and the
//! unterminated remainder is carried forward to the next chunk.
//!
//! Malformed lines are dropped and counted rather than failing the whole
//! stream. A partial line that grows past the configured limit puts the
//! decoder into [`DecoderState::ErrorDiscard`], in which bytes are skipped
//! until the next delimiter.

use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use tracing::warn;

/// Default upper bound for a single line, delimiter excluded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Errors produced while framing records.
#[derive(Debug)]
pub enum FrameError {
    /// The record could not be serialized.
    Encode { reason: String },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode { reason } => write!(f, "failed to encode record: {reason}"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Serializes a record as one delimited line.
///
/// # Errors
///
/// Returns an error if the value cannot be represented as JSON.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let mut line = serde_json::to_vec(value).map_err(|e| FrameError::Encode {
        reason: e.to_string(),
    })?;
    line.push(b'\n');
    Ok(line)
}

/// Where the decoder currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// No complete line is buffered; waiting for more bytes.
    Accumulating,
    /// At least one complete line is buffered and can be taken.
    HaveLine,
    /// An overlong line was dropped; bytes are skipped until the next delimiter.
    ErrorDiscard,
}

/// Line-buffering decoder for delimited records.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    // Prefix of `buf` already known to contain no delimiter.
    scanned: usize,
    state: DecoderState,
    max_line_bytes: usize,
    discarded: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl LineDecoder {
    /// Creates a decoder with the default line limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }

    /// Creates a decoder that drops lines longer than `max_line_bytes`.
    #[must_use]
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            state: DecoderState::Accumulating,
            max_line_bytes,
            discarded: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Number of lines dropped so far (malformed, non UTF-8 or overlong).
    #[must_use]
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feeds a chunk of bytes, however the transport happened to cut it.
    pub fn push(&mut self, chunk: &[u8]) {
        let mut chunk = chunk;

        if self.state == DecoderState::ErrorDiscard {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    chunk = &chunk[pos + 1..];
                    self.state = DecoderState::Accumulating;
                }
                None => return,
            }
        }

        self.buf.extend_from_slice(chunk);
        self.settle();
    }

    /// Takes the next complete, non-blank line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.find_delimiter() else {
                self.settle();
                return None;
            };

            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.scanned = 0;
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if line.len() > self.max_line_bytes {
                self.drop_line("line exceeds size limit");
                continue;
            }

            match String::from_utf8(line) {
                Ok(text) if text.trim().is_empty() => continue,
                Ok(text) => {
                    self.settle();
                    return Some(text);
                }
                Err(_) => self.drop_line("line is not valid UTF-8"),
            }
        }
    }

    /// Takes and parses the next record, skipping malformed lines.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Option<T> {
        while let Some(line) = self.next_line() {
            match serde_json::from_str(&line) {
                Ok(frame) => return Some(frame),
                Err(e) => self.drop_line(&e.to_string()),
            }
        }
        None
    }

    /// Flushes the unterminated remainder as a final line.
    ///
    /// Returns `None` when nothing (or only whitespace) is left, or when the
    /// decoder is discarding an overlong line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        let discarding = self.state == DecoderState::ErrorDiscard;
        self.state = DecoderState::Accumulating;

        if discarding {
            return None;
        }

        match String::from_utf8(rest) {
            Ok(text) => {
                let text = text.trim_end_matches('\r');
                if text.trim().is_empty() {
                    None
                } else {
                    Some(text.to_string())
                }
            }
            Err(_) => {
                self.drop_line("trailing bytes are not valid UTF-8");
                None
            }
        }
    }

    /// Flushes and parses the unterminated remainder.
    pub fn finish_frame<T: DeserializeOwned>(&mut self) -> Option<T> {
        let line = self.finish()?;
        match serde_json::from_str(&line) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.drop_line(&e.to_string());
                None
            }
        }
    }

    fn find_delimiter(&mut self) -> Option<usize> {
        match self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
            Some(offset) => Some(self.scanned + offset),
            None => {
                self.scanned = self.buf.len();
                None
            }
        }
    }

    fn settle(&mut self) {
        // Only a delimiter seen by `push` ends a discard.
        if self.state == DecoderState::ErrorDiscard {
            return;
        }
        if self.find_delimiter().is_some() {
            self.state = DecoderState::HaveLine;
        } else if self.buf.len() > self.max_line_bytes {
            self.buf.clear();
            self.scanned = 0;
            self.drop_line("partial line exceeds size limit");
            self.state = DecoderState::ErrorDiscard;
        } else {
            self.state = DecoderState::Accumulating;
        }
    }

    fn drop_line(&mut self, reason: &str) {
        self.discarded += 1;
        warn!(reason, discarded = self.discarded, "dropping malformed line");
    }
}

enum Phase {
    Reading,
    Draining,
    Done,
}

/// Adapts a stream of byte chunks into a stream of parsed records.
///
/// Transport errors are forwarded and end the stream. Malformed lines are
/// skipped.
pub fn decode_stream<S, B, E, T>(chunks: S) -> impl Stream<Item = Result<T, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    T: DeserializeOwned,
{
    let state = (Box::pin(chunks), LineDecoder::new(), Phase::Reading);

    futures::stream::unfold(state, |(mut chunks, mut decoder, mut phase)| async move {
        loop {
            match phase {
                Phase::Done => return None,
                Phase::Draining => {
                    if let Some(frame) = decoder.next_frame::<T>() {
                        return Some((Ok(frame), (chunks, decoder, Phase::Draining)));
                    }
                    let last = decoder.finish_frame::<T>()?;
                    return Some((Ok(last), (chunks, decoder, Phase::Done)));
                }
                Phase::Reading => {
                    if let Some(frame) = decoder.next_frame::<T>() {
                        return Some((Ok(frame), (chunks, decoder, Phase::Reading)));
                    }
                    match chunks.next().await {
                        Some(Ok(chunk)) => decoder.push(chunk.as_ref()),
                        Some(Err(e)) => return Some((Err(e), (chunks, decoder, Phase::Done))),
                        None => phase = Phase::Draining,
                    }
                }
            }
        }
    })
}
