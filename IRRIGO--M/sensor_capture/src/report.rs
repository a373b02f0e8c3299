//! Section-scoped key/value report parsing.
//!
//! A device dump is a sequence of lines. A header `[<scope>:<name>]` opens the
//! section `<name>` for the scope being captured; any other bracketed line
//! closes it. Inside an open section, `key: value` lines are collected. Lines
//! that cannot be interpreted are dropped, so parsing never fails.

use chrono::{Local, NaiveDateTime};
use indexmap::IndexMap;
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Key/value pairs of one section, in first-seen order.
pub type Section = IndexMap<String, String>;

/// Field names injected by the capture path. Sections with these names are
/// kept in [`SensorRecord::sections`] but never serialized over the fields.
pub const RESERVED_FIELDS: [&str; 2] = ["sensor", "timestamp"];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// Structured record produced from one raw report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorRecord {
    sensor: String,
    sections: IndexMap<String, Section>,
    timestamp: Option<NaiveDateTime>,
}

impl SensorRecord {
    /// Creates an empty record for `sensor`.
    #[must_use]
    pub fn new(sensor: impl Into<String>) -> Self {
        Self {
            sensor: sensor.into(),
            sections: IndexMap::new(),
            timestamp: None,
        }
    }

    /// Scope name the record was parsed for.
    #[must_use]
    pub fn sensor(&self) -> &str {
        &self.sensor
    }

    /// All sections in first-seen order.
    #[must_use]
    pub const fn sections(&self) -> &IndexMap<String, Section> {
        &self.sections
    }

    /// Looks up one section.
    #[must_use]
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    /// Looks up one value.
    #[must_use]
    pub fn value(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    /// Capture time, once stamped.
    #[must_use]
    pub const fn timestamp(&self) -> Option<NaiveDateTime> {
        self.timestamp
    }

    /// Stamps the record with an explicit capture time.
    #[must_use]
    pub fn stamped_at(mut self, at: NaiveDateTime) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Stamps the record with the current local wall time.
    #[must_use]
    pub fn stamped_now(self) -> Self {
        self.stamped_at(Local::now().naive_local())
    }

    /// ISO-8601 rendering of the capture time (microsecond precision, no offset).
    #[must_use]
    pub fn timestamp_iso(&self) -> Option<String> {
        self.timestamp
            .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
    }
}

impl Serialize for SensorRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("sensor", &self.sensor)?;
        for (name, section) in &self.sections {
            if RESERVED_FIELDS.contains(&name.as_str()) {
                continue;
            }
            map.serialize_entry(name, section)?;
        }
        if let Some(ts) = self.timestamp_iso() {
            map.serialize_entry("timestamp", &ts)?;
        }
        map.end()
    }
}

/// Incremental parser; feed lines as they arrive and call [`ReportParser::finish`].
#[derive(Debug, Clone)]
pub struct ReportParser {
    open_token: String,
    record: SensorRecord,
    current: Option<String>,
}

impl ReportParser {
    /// Creates a parser recognizing headers of `scope`.
    #[must_use]
    pub fn new(scope: &str) -> Self {
        Self {
            open_token: format!("[{scope}:"),
            record: SensorRecord::new(scope),
            current: None,
        }
    }

    /// Name of the currently open section.
    #[must_use]
    pub fn current_section(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Consumes one line.
    pub fn feed_line(&mut self, line: &str) {
        let bracketed = line.starts_with('[') && line.ends_with(']');
        if bracketed && line.starts_with(self.open_token.as_str()) {
            let name = &line[self.open_token.len()..line.len() - 1];
            self.record
                .sections
                .insert(name.to_string(), Section::new());
            self.current = Some(name.to_string());
            return;
        }
        if bracketed {
            self.current = None;
            return;
        }
        let Some(section) = self.current.as_ref() else {
            return;
        };
        let Some((key, value)) = line.split_once(':') else {
            return;
        };
        if let Some(entries) = self.record.sections.get_mut(section) {
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    /// Returns the record built so far (unstamped).
    #[must_use]
    pub fn finish(self) -> SensorRecord {
        self.record
    }
}

/// Parses a whole report for `scope`. Never fails; unknown lines are dropped.
#[must_use]
pub fn parse_report(raw: &str, scope: &str) -> SensorRecord {
    let mut parser = ReportParser::new(scope);
    for line in raw.trim().lines() {
        parser.feed_line(line);
    }
    parser.finish()
}
