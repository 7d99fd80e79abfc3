// src/output/multiplexer.rs

//! Turn raw output chunks into labelled log records.
//!
//! Every chunk is handled on its own. A line that the OS delivered across
//! two reads comes out as two partial lines; nothing is buffered between
//! chunks.

use std::fmt;

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Stdout => f.write_str("stdout"),
            Channel::Stderr => f.write_str("stderr"),
        }
    }
}

/// One displayable line of service output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub label: String,
    pub channel: Channel,
    pub text: String,
}

/// Split a chunk on `\n`, trim trailing whitespace from each segment and
/// drop segments that end up empty.
pub fn split_lines(chunk: &str) -> impl Iterator<Item = &str> {
    chunk
        .split('\n')
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
}

/// Map a chunk to the records it produces, in order.
pub fn consume<'a>(
    chunk: &'a str,
    label: &'a str,
    channel: Channel,
) -> impl Iterator<Item = LogRecord> + 'a {
    split_lines(chunk).map(move |text| LogRecord {
        label: label.to_string(),
        channel,
        text: text.to_string(),
    })
}

/// Same as [`consume`] for raw bytes; invalid UTF-8 is replaced lossily.
pub fn consume_bytes(bytes: &[u8], label: &str, channel: Channel) -> Vec<LogRecord> {
    let chunk = String::from_utf8_lossy(bytes);
    consume(&chunk, label, channel).collect()
}
