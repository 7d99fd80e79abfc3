// src/output/mod.rs

//! Live output of supervised services.
//!
//! - `multiplexer.rs`: chunk -> `LogRecord` mapping.
//! - `sink.rs`: where records and lifecycle lines end up.

pub mod multiplexer;
pub mod sink;

pub use multiplexer::{Channel, LogRecord, consume, consume_bytes, split_lines};
pub use sink::{ConsoleSink, LogSink};
