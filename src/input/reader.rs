// SPDX-License-Identifier: Apache-2.0

//! Incremental newline splitting over raw file chunks.

use bytes::Bytes;

use crate::event::LineOffset;

/// A complete line and the bytes it consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Raw line content without its terminator
    pub content: Bytes,
    pub range: LineOffset,
}

/// LineReader turns arbitrary chunks of file content into complete lines.
///
/// Bytes after the last `\n` are held back until a terminator arrives, so an
/// unterminated trailing line is never emitted. Lines longer than
/// `max_line_bytes` keep only their first `max_line_bytes` bytes of content
/// while their consumed range still covers the whole line. Content is kept
/// as raw bytes; no decoding happens here.
#[derive(Debug)]
pub struct LineReader {
    /// Held bytes of the unterminated line, capped at max_line_bytes + 1
    pending: Vec<u8>,
    /// Total length of the unterminated line, including dropped bytes
    pending_len: u64,
    /// File offset where the unterminated line begins
    line_start: u64,
    max_line_bytes: usize,
}

impl LineReader {
    pub fn new(start_offset: u64, max_line_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            pending_len: 0,
            line_start: start_offset,
            max_line_bytes,
        }
    }

    /// Offset just past the last complete line.
    pub fn committed_offset(&self) -> u64 {
        self.line_start
    }

    /// Offset just past the last byte fed in.
    pub fn read_offset(&self) -> u64 {
        self.line_start + self.pending_len
    }

    /// Bytes of an unterminated line currently held.
    pub fn pending_len(&self) -> u64 {
        self.pending_len
    }

    /// Drop any partial line and restart at `offset`.
    pub fn reset(&mut self, offset: u64) {
        self.pending.clear();
        self.pending_len = 0;
        self.line_start = offset;
    }

    /// Feed the next chunk, returning every line it completes.
    pub fn push(&mut self, mut chunk: &[u8]) -> Vec<Line> {
        let mut lines = Vec::new();

        while let Some(pos) = chunk.iter().position(|b| *b == b'\n') {
            self.buffer(&chunk[..pos]);
            let len = self.pending_len + 1;
            let content = self.take_content();
            lines.push(Line {
                content,
                range: LineOffset::new(self.line_start, len),
            });
            self.line_start += len;
            self.pending_len = 0;
            chunk = &chunk[pos + 1..];
        }

        self.buffer(chunk);
        lines
    }

    fn buffer(&mut self, bytes: &[u8]) {
        // One byte past the limit is kept so a trailing '\r' can still be detected
        let room = (self.max_line_bytes + 1).saturating_sub(self.pending.len());
        let keep = room.min(bytes.len());
        self.pending.extend_from_slice(&bytes[..keep]);
        self.pending_len += bytes.len() as u64;
    }

    fn take_content(&mut self) -> Bytes {
        let mut bytes = std::mem::take(&mut self.pending);
        let full_len = self.pending_len as usize;

        if full_len > 0 && full_len <= bytes.len() && bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        bytes.truncate(self.max_line_bytes);
        Bytes::from(bytes)
    }
}
