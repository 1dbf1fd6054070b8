use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

/// Severity of a [`Record`]. Numeric values are part of the wire format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Verbose = 5,
}

impl Level {
    pub(crate) fn from_u8(v: u8) -> Option<Level> {
        match v {
            1 => Some(Level::Error),
            2 => Some(Level::Warn),
            3 => Some(Level::Info),
            4 => Some(Level::Debug),
            5 => Some(Level::Verbose),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Verbose => "VERBOSE",
        }
    }
}

/// Source position of a record. All parts are optional; fillers that cannot
/// resolve a part leave it `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Location {
    pub file: Option<String>,
    pub function: Option<String>,
    pub line: Option<u32>,
}

/// One structured log record.
///
/// Textual fields are arbitrary bytes that readers treat as UTF-8
/// best-effort; the engine never inspects them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub level: Level,
    pub datetime: Timestamp,
    pub tag: Option<String>,
    pub location: Location,
    pub thread_id: Option<u64>,
    pub content: String,
}

impl Record {
    /// A record stamped with the system clock and the calling thread.
    pub fn new(level: Level, content: impl Into<String>) -> Self {
        Self {
            level,
            datetime: Timestamp::now(),
            tag: None,
            location: Location::default(),
            thread_id: Some(crate::clock::thread_id()),
            content: content.into(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn with_datetime(mut self, datetime: Timestamp) -> Self {
        self.datetime = datetime;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn level_round_trips_through_wire_value() {
        for level in [
            Level::Error,
            Level::Warn,
            Level::Info,
            Level::Debug,
            Level::Verbose,
        ] {
            assert_eq!(Level::from_u8(level as u8), Some(level));
        }
        assert_eq!(Level::from_u8(0), None);
        assert_eq!(Level::from_u8(6), None);
    }

    #[test]
    fn new_record_carries_thread_and_time() {
        let r = Record::new(Level::Info, "hello");
        assert_eq!(r.thread_id, Some(crate::clock::thread_id()));
        assert!(r.datetime.secs > 0);
        assert_eq!(r.content, "hello");
    }
}
