// SPDX-License-Identifier: Apache-2.0

//! Events produced by harvesters and the batches that carry them downstream.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use crate::input::FileId;

/// Byte range of the file consumed to produce one line.
///
/// `len` covers the whole line including its terminator, so the next line
/// starts at `end_offset()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOffset {
    /// Byte position where the line begins
    pub offset: u64,
    /// Length of the line in bytes (including newline)
    pub len: u64,
}

impl LineOffset {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Get the ending byte position (offset + len)
    pub fn end_offset(&self) -> u64 {
        self.offset + self.len
    }
}

/// Resume position for one file: offsets are only comparable inside the same
/// truncation generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position {
    pub generation: u64,
    pub offset: u64,
}

impl Position {
    pub fn new(generation: u64, offset: u64) -> Self {
        Self { generation, offset }
    }
}

/// One delimited line read from a file.
#[derive(Debug, Clone)]
pub struct Event {
    pub file_id: FileId,
    pub source: PathBuf,
    /// Raw line bytes as read from the file, without the terminator
    pub line: Bytes,
    pub range: LineOffset,
    /// Truncation generation the bytes were read in
    pub generation: u64,
    pub read_at: DateTime<Utc>,
    /// Static fields shared by every event of the process
    pub fields: Arc<BTreeMap<String, String>>,
}

impl Event {
    /// Position a reader would resume from once this event is delivered.
    pub fn resume_position(&self) -> Position {
        Position::new(self.generation, self.range.end_offset())
    }

    /// Start offset, exposed as `offset` in the serialized document.
    pub fn offset(&self) -> u64 {
        self.range.offset
    }
}

/// Events flushed together by the spooler.
///
/// Arrival order is preserved, so events from one file stay in file order.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    events: Vec<Event>,
}

impl Batch {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Furthest position reached per file, with the path last seen for it.
    pub fn positions(&self) -> HashMap<FileId, (Position, &PathBuf)> {
        let mut out: HashMap<FileId, (Position, &PathBuf)> = HashMap::new();
        for event in &self.events {
            let pos = event.resume_position();
            out.entry(event.file_id)
                .and_modify(|cur| {
                    if pos > cur.0 {
                        *cur = (pos, &event.source);
                    }
                })
                .or_insert((pos, &event.source));
        }
        out
    }
}

impl From<Vec<Event>> for Batch {
    fn from(events: Vec<Event>) -> Self {
        Self::new(events)
    }
}

/// Wire document for a single event.
///
/// Invalid UTF-8 in the line is replaced with U+FFFD here and nowhere else.
#[derive(Serialize)]
pub struct EventRecord<'a> {
    #[serde(rename = "@timestamp")]
    pub timestamp: &'a DateTime<Utc>,
    pub source: &'a PathBuf,
    pub offset: u64,
    pub line: Cow<'a, str>,
    pub file_id: String,
    #[serde(skip_serializing_if = "no_fields")]
    pub fields: &'a BTreeMap<String, String>,
}

fn no_fields(fields: &&BTreeMap<String, String>) -> bool {
    fields.is_empty()
}

impl<'a> From<&'a Event> for EventRecord<'a> {
    fn from(event: &'a Event) -> Self {
        Self {
            timestamp: &event.read_at,
            source: &event.source,
            offset: event.offset(),
            line: String::from_utf8_lossy(&event.line),
            file_id: event.file_id.to_string(),
            fields: &event.fields,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_event(file_id: FileId, generation: u64, offset: u64, line: &str) -> Event {
    Event {
        file_id,
        source: PathBuf::from("/var/log/test.log"),
        line: Bytes::copy_from_slice(line.as_bytes()),
        range: LineOffset::new(offset, line.len() as u64 + 1),
        generation,
        read_at: Utc::now(),
        fields: Arc::new(BTreeMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_positions_take_max_per_file() {
        let a = FileId::new(1, 10);
        let b = FileId::new(1, 20);
        let batch = Batch::new(vec![
            test_event(a, 0, 0, "one"),
            test_event(b, 0, 0, "first"),
            test_event(a, 0, 4, "two"),
        ]);

        let positions = batch.positions();
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[&a].0, Position::new(0, 8));
        assert_eq!(positions[&b].0, Position::new(0, 6));
    }

    #[test]
    fn test_newer_generation_wins_in_batch() {
        let a = FileId::new(1, 10);
        let batch = Batch::new(vec![
            test_event(a, 0, 500, "old tail"),
            test_event(a, 1, 0, "new"),
        ]);

        assert_eq!(batch.positions()[&a].0, Position::new(1, 4));
    }

    #[test]
    fn test_record_serialization() {
        let mut fields = BTreeMap::new();
        fields.insert("env".to_string(), "prod".to_string());
        let mut event = test_event(FileId::new(3, 7), 0, 12, "hello");
        event.fields = Arc::new(fields);

        let json = serde_json::to_value(EventRecord::from(&event)).unwrap();
        assert_eq!(json["line"], "hello");
        assert_eq!(json["offset"], 12);
        assert_eq!(json["file_id"], "3:7");
        assert_eq!(json["fields"]["env"], "prod");
        assert!(json.get("@timestamp").is_some());
    }

    #[test]
    fn test_non_utf8_line_decoded_only_on_serialization() {
        let mut event = test_event(FileId::new(3, 7), 0, 0, "");
        event.line = Bytes::from_static(b"caf\xe9");
        event.range = LineOffset::new(0, 5);

        assert_eq!(&event.line[..], b"caf\xe9");
        let json = serde_json::to_value(EventRecord::from(&event)).unwrap();
        assert_eq!(json["line"], "caf\u{fffd}");
        assert_eq!(event.resume_position(), Position::new(0, 5));
    }
}
