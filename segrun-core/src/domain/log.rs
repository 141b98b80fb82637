//! Progress and log domain types

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a progress event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Phase of a case (or of the job) an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    /// Job or case bookkeeping done by the orchestrator itself
    Setup,
    Preprocessing,
    Inference,
    Postprocessing,
    Packaging,
    /// Raw tool output that matched no known pattern
    Output,
}

/// A structured record derived from process output or emitted by the orchestrator
///
/// Immutable once appended to a job log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub timestamp: DateTime<Utc>,
    pub case_id: Option<String>,
    pub stage: Stage,
    pub level: LogLevel,
    pub message: String,
    /// Percent-complete hint for the current case, if the line carried one
    pub percent: Option<u8>,
    pub is_error: bool,
}

impl ProgressEvent {
    pub fn new(stage: Stage, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            case_id: None,
            stage,
            level,
            message: message.into(),
            percent: None,
            is_error: level == LogLevel::Error,
        }
    }

    pub fn info(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, LogLevel::Info, message)
    }

    pub fn warning(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, LogLevel::Warning, message)
    }

    pub fn error(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(stage, LogLevel::Error, message)
    }

    pub fn for_case(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent.min(100));
        self
    }
}

/// A progress event together with its position in the job log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u64,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

/// Result of reading a job log from a cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSlice {
    pub records: Vec<LogRecord>,
    /// Cursor to pass on the next read
    pub next_cursor: u64,
    /// Events after the requested cursor that were already trimmed by retention
    pub dropped: u64,
}

/// Append-only, bounded job log
///
/// Sequence numbers start at 1 and grow by one per appended event. Once more
/// than `capacity` events are held the oldest are trimmed, but sequence numbers
/// are never reused, so a cursor stays meaningful across trimming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    records: VecDeque<LogRecord>,
    capacity: usize,
    next_seq: u64,
}

impl JobLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_seq: 1,
        }
    }

    /// Appends an event and returns its sequence number
    pub fn push(&mut self, event: ProgressEvent) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.records.push_back(LogRecord { seq, event });
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
        seq
    }

    /// Sequence number of the newest event, 0 when nothing was ever logged
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns every retained event with `seq > cursor`
    pub fn since(&self, cursor: u64) -> LogSlice {
        let first_retained = self
            .records
            .front()
            .map(|r| r.seq)
            .unwrap_or(self.next_seq);
        let dropped = first_retained.saturating_sub(cursor.saturating_add(1));

        let records: Vec<LogRecord> = self
            .records
            .iter()
            .filter(|r| r.seq > cursor)
            .cloned()
            .collect();
        let next_cursor = records.last().map(|r| r.seq).unwrap_or(cursor);

        LogSlice {
            records,
            next_cursor,
            dropped,
        }
    }

    /// The `n` newest events, oldest first
    pub fn recent(&self, n: usize) -> Vec<LogRecord> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }
}

impl Default for JobLog {
    fn default() -> Self {
        Self::with_capacity(2000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(msg: &str) -> ProgressEvent {
        ProgressEvent::info(Stage::Setup, msg)
    }

    #[test]
    fn test_sequence_numbers_start_at_one() {
        let mut log = JobLog::with_capacity(10);
        assert_eq!(log.last_seq(), 0);
        assert_eq!(log.push(event("a")), 1);
        assert_eq!(log.push(event("b")), 2);
        assert_eq!(log.last_seq(), 2);
    }

    #[test]
    fn test_retention_trims_oldest() {
        let mut log = JobLog::with_capacity(3);
        for i in 0..5 {
            log.push(event(&format!("m{}", i)));
        }
        assert_eq!(log.len(), 3);
        let all = log.since(0);
        let seqs: Vec<u64> = all.records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(all.dropped, 2);
        assert_eq!(all.next_cursor, 5);
    }

    #[test]
    fn test_cursor_polling_has_no_gaps_or_duplicates() {
        let mut log = JobLog::with_capacity(100);
        let mut seen = Vec::new();
        let mut cursor = 0;

        for batch in 0..4 {
            for i in 0..batch + 1 {
                log.push(event(&format!("{}-{}", batch, i)));
            }
            let slice = log.since(cursor);
            assert_eq!(slice.dropped, 0);
            seen.extend(slice.records.iter().map(|r| r.seq));
            cursor = slice.next_cursor;
        }

        let expected: Vec<u64> = (1..=log.last_seq()).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_since_without_new_events_keeps_cursor() {
        let mut log = JobLog::with_capacity(10);
        log.push(event("a"));
        let slice = log.since(1);
        assert!(slice.records.is_empty());
        assert_eq!(slice.next_cursor, 1);
        assert_eq!(slice.dropped, 0);

        let ahead = log.since(42);
        assert!(ahead.records.is_empty());
        assert_eq!(ahead.next_cursor, 42);
    }

    #[test]
    fn test_recent_returns_newest_in_order() {
        let mut log = JobLog::with_capacity(10);
        for i in 0..6 {
            log.push(event(&format!("m{}", i)));
        }
        let recent = log.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event.message, "m4");
        assert_eq!(recent[1].event.message, "m5");
    }

    #[test]
    fn test_error_constructor_sets_flag() {
        let e = ProgressEvent::error(Stage::Inference, "boom").for_case("c1");
        assert!(e.is_error);
        assert_eq!(e.case_id.as_deref(), Some("c1"));
        assert!(!ProgressEvent::info(Stage::Setup, "ok").is_error);
    }
}
