#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Sensor report capture: turns a device's raw console dump into a structured record.

/// Section-scoped key/value parser and the record type.
pub mod report;

/// Capture pipeline wiring the parser to logging and record sinks.
pub mod capture;

pub use capture::{CaptureSession, CaptureSessionBuilder};
pub use report::{parse_report, ReportParser, Section, SensorRecord};
