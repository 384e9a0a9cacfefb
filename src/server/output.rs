//! Bounded output history.

// Timestamp won't overflow u64 until year 584942417355
#![allow(clippy::cast_possible_truncation)]

use crate::protocol::OutputChunk;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum number of chunks retained per session.
pub const MAX_CHUNKS: usize = 1000;

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// FIFO of decoded output chunks, bounded by chunk count.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    capacity: usize,
    chunks: VecDeque<OutputChunk>,
}

impl OutputBuffer {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            chunks: VecDeque::new(),
        }
    }

    /// Rebuild from persisted chunks, keeping only the newest ones.
    #[must_use]
    pub fn from_chunks(capacity: usize, chunks: Vec<OutputChunk>) -> Self {
        let mut buffer = Self::new(capacity);
        for chunk in chunks {
            buffer.push_chunk(chunk);
        }
        buffer
    }

    /// Append decoded output stamped with the current time.
    pub fn push(&mut self, data: String) {
        self.push_chunk(OutputChunk {
            timestamp: now_millis(),
            data,
        });
    }

    fn push_chunk(&mut self, chunk: OutputChunk) {
        while self.chunks.len() >= self.capacity.max(1) {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutputChunk> {
        self.chunks.iter()
    }

    /// Owned copy of every retained chunk, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<OutputChunk> {
        self.chunks.iter().cloned().collect()
    }

    /// Concatenation of the newest chunks holding at least `max_chars`
    /// characters (or everything, if there is less).
    #[must_use]
    pub fn tail_text(&self, max_chars: usize) -> String {
        let mut taken = 0;
        let mut start = self.chunks.len();
        for chunk in self.chunks.iter().rev() {
            if taken >= max_chars {
                break;
            }
            taken += chunk.data.chars().count();
            start -= 1;
        }
        self.chunks.range(start..).map(|c| c.data.as_str()).collect()
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(MAX_CHUNKS)
    }
}

/// Incremental UTF-8 decoder.
///
/// PTY reads split multi-byte sequences arbitrarily; incomplete trailing
/// bytes are carried into the next read. Invalid sequences become U+FFFD.
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(bytes);

        let mut out = String::with_capacity(buf.len());
        let mut input = buf.as_slice();
        loop {
            match std::str::from_utf8(input) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, rest) = input.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    if let Some(len) = e.error_len() {
                        out.push(char::REPLACEMENT_CHARACTER);
                        input = &rest[len..];
                    } else {
                        self.carry = rest.to_vec();
                        break;
                    }
                }
            }
        }
        out
    }

    /// Whether bytes of an incomplete sequence are pending.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.carry.is_empty()
    }

    /// Drop pending bytes, e.g. when the process behind the stream changes.
    pub fn reset(&mut self) {
        self.carry.clear();
    }
}
