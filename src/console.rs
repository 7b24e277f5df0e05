//! Guest log console
//!
//! Messages the guest logs through the `log` host call are kept in a
//! bounded, ordered buffer so a debugger UI can show them. Entries live in a
//! [`Slab`]; their text lives in a [`PayloadArena`]. When either the entry
//! limit or the arena runs out, the oldest entries are recycled first.
//!
//! Every message is also forwarded to `tracing` under the `guest` target.

use crate::arena::{PayloadArena, Span};
use slab::Slab;
use std::borrow::Cow;
use std::collections::VecDeque;
use tracing::{error, info, warn};

/// Arena bytes reserved per retained entry
const ARENA_BYTES_PER_ENTRY: usize = 256;

/// Guest log severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LogLevel {
    Error = 0,
    Warning = 1,
    Info = 2,
}

impl LogLevel {
    /// Unknown levels are treated as `Info`
    pub fn from_i32(level: i32) -> Self {
        match level {
            0 => LogLevel::Error,
            1 => LogLevel::Warning,
            _ => LogLevel::Info,
        }
    }
}

struct LogEntry {
    index: u64,
    level: LogLevel,
    line: i32,
    file: Option<Span>,
    message: Option<Span>,
}

/// A retained log message
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord<'a> {
    /// Sequence number, counting every message ever logged
    pub index: u64,
    pub level: LogLevel,
    pub file: Cow<'a, str>,
    pub line: i32,
    pub message: Cow<'a, str>,
}

pub struct Console {
    entries: Slab<LogEntry>,
    /// Slab keys, oldest first
    order: VecDeque<usize>,
    arena: PayloadArena,
    capacity: usize,
    next_index: u64,
}

impl Console {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Slab::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            arena: PayloadArena::new(capacity.saturating_mul(ARENA_BYTES_PER_ENTRY)),
            capacity,
            next_index: 0,
        }
    }

    /// Record a guest message and forward it to `tracing`
    ///
    /// Text longer than the largest arena block is truncated. Older entries
    /// are recycled until the arena can hold the new text.
    pub fn push(&mut self, level: LogLevel, file: &[u8], line: i32, message: &[u8]) -> u64 {
        let index = self.next_index;
        self.next_index += 1;

        let file_text = String::from_utf8_lossy(file);
        let text = String::from_utf8_lossy(message);
        match level {
            LogLevel::Error => error!(target: "guest", file = %file_text, line, "{text}"),
            LogLevel::Warning => warn!(target: "guest", file = %file_text, line, "{text}"),
            LogLevel::Info => info!(target: "guest", file = %file_text, line, "{text}"),
        }

        if self.capacity == 0 {
            return index;
        }
        while self.order.len() >= self.capacity {
            self.evict_oldest();
        }

        let limit = self.arena.max_block();
        let message = self.alloc(&message[..message.len().min(limit)]);
        let file = self.alloc(&file[..file.len().min(limit)]);
        let key = self.entries.insert(LogEntry {
            index,
            level,
            line,
            file,
            message,
        });
        self.order.push_back(key);
        index
    }

    fn alloc(&mut self, bytes: &[u8]) -> Option<Span> {
        loop {
            if let Some(span) = self.arena.alloc(bytes) {
                return Some(span);
            }
            if !self.evict_oldest() {
                return None;
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some(key) = self.order.pop_front() else {
            return false;
        };
        let entry = self.entries.remove(key);
        for span in [entry.file, entry.message].into_iter().flatten() {
            self.arena.free(span);
        }
        true
    }

    fn text(&self, span: Option<Span>) -> Cow<'_, str> {
        match span {
            Some(span) => String::from_utf8_lossy(self.arena.get(span)),
            None => Cow::Borrowed(""),
        }
    }

    /// Retained messages, oldest first
    pub fn iter(&self) -> impl Iterator<Item = LogRecord<'_>> + '_ {
        self.order.iter().map(move |&key| {
            let entry = &self.entries[key];
            LogRecord {
                index: entry.index,
                level: entry.level,
                file: self.text(entry.file),
                line: entry.line,
                message: self.text(entry.message),
            }
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Messages logged since creation, including recycled ones
    pub fn total_logged(&self) -> u64 {
        self.next_index
    }

    pub fn clear(&mut self) {
        while self.evict_oldest() {}
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new(512)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::MAX_PAYLOAD;

    #[test]
    fn test_push_and_iter() {
        let mut console = Console::new(8);
        console.push(LogLevel::Info, b"main.c", 12, b"hello");
        console.push(LogLevel::Error, b"io.c", 40, b"open failed");

        let records: Vec<_> = console.iter().collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "hello");
        assert_eq!(records[0].file, "main.c");
        assert_eq!(records[0].line, 12);
        assert_eq!(records[1].level, LogLevel::Error);
        assert_eq!(records[1].index, 1);
    }

    #[test]
    fn test_oldest_recycled_when_full() {
        let mut console = Console::new(3);
        for i in 0..5 {
            console.push(LogLevel::Info, b"f", i, format!("msg {i}").as_bytes());
        }

        let messages: Vec<_> = console.iter().map(|r| r.message.into_owned()).collect();
        assert_eq!(messages, vec!["msg 2", "msg 3", "msg 4"]);
        assert_eq!(console.total_logged(), 5);
    }

    #[test]
    fn test_arena_pressure_evicts() {
        // 2 entries * 256 bytes of arena; two 200-byte messages need 512
        let mut console = Console::new(2);
        console.push(LogLevel::Info, b"", 0, &[b'a'; 200]);
        console.push(LogLevel::Info, b"", 0, &[b'b'; 200]);

        assert_eq!(console.len(), 1);
        assert_eq!(console.iter().next().unwrap().message, "b".repeat(200));
    }

    #[test]
    fn test_long_line_after_many_short_keeps_history() {
        let mut console = Console::new(16);
        for i in 0..16 {
            console.push(LogLevel::Info, b"f", i, &[b'a'; 200]);
        }
        let before = console.len();

        console.push(LogLevel::Error, b"f", 99, &[b'z'; 1000]);
        let records: Vec<_> = console.iter().collect();
        let last = records.last().unwrap();
        assert_eq!(last.line, 99);
        assert_eq!(last.message, "z".repeat(1000));
        assert!(records.len() > 1 && records.len() <= before);

        // Short messages reuse the space the long one split off
        for i in 0..4 {
            console.push(LogLevel::Info, b"g", i, b"short");
        }
        assert_eq!(console.iter().last().unwrap().message, "short");
    }

    #[test]
    fn test_message_larger_than_arena_truncated_to_fit() {
        // 1 entry * 256 bytes of arena
        let mut console = Console::new(1);
        console.push(LogLevel::Info, b"", 0, &[b'q'; 600]);
        assert_eq!(console.iter().next().unwrap().message.len(), 256);
    }

    #[test]
    fn test_long_message_truncated() {
        let mut console = Console::new(64);
        console.push(LogLevel::Warning, b"x", 1, &vec![b'z'; MAX_PAYLOAD + 100]);
        assert_eq!(console.iter().next().unwrap().message.len(), MAX_PAYLOAD);
    }

    #[test]
    fn test_unknown_level_is_info() {
        assert_eq!(LogLevel::from_i32(7), LogLevel::Info);
        assert_eq!(LogLevel::from_i32(0), LogLevel::Error);
    }

    #[test]
    fn test_zero_capacity_only_forwards() {
        let mut console = Console::new(0);
        assert_eq!(console.push(LogLevel::Info, b"", 0, b"x"), 0);
        assert!(console.is_empty());
        assert_eq!(console.total_logged(), 1);
    }

    #[test]
    fn test_clear() {
        let mut console = Console::new(4);
        console.push(LogLevel::Info, b"a", 1, b"one");
        console.clear();
        assert!(console.is_empty());
        console.push(LogLevel::Info, b"a", 2, b"two");
        assert_eq!(console.len(), 1);
    }
}
