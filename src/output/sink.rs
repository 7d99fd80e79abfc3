// src/output/sink.rs

use std::io::{self, Stdout, Write};
use std::sync::Mutex;

use colored::{Color, Colorize};

use crate::output::multiplexer::{Channel, LogRecord};

/// Destination for service output and lifecycle lines.
pub trait LogSink: Send + Sync {
    fn record(&self, record: &LogRecord);

    /// Lines produced by the supervisor itself (exit, close, kill).
    fn lifecycle(&self, label: &str, message: &str);
}

/// Writes `<label>: <text>` lines, label coloured by channel.
pub struct ConsoleSink<W: Write + Send = Stdout> {
    output: Mutex<W>,
}

impl<W: Write + Send> ConsoleSink<W> {
    pub fn new(output: W) -> Self {
        Self {
            output: Mutex::new(output),
        }
    }

    pub fn into_inner(self) -> W {
        self.output.into_inner().unwrap_or_else(|e| e.into_inner())
    }

    fn write_line(&self, label: &str, color: Color, text: &str) {
        let prefix = format!("{label}:").color(color);
        let mut out = self.output.lock().unwrap_or_else(|e| e.into_inner());
        let _ = writeln!(out, "{prefix} {text}");
        let _ = out.flush();
    }
}

impl ConsoleSink {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

fn channel_color(channel: Channel) -> Color {
    match channel {
        Channel::Stdout => Color::Green,
        Channel::Stderr => Color::Red,
    }
}

impl<W: Write + Send> LogSink for ConsoleSink<W> {
    fn record(&self, record: &LogRecord) {
        self.write_line(&record.label, channel_color(record.channel), &record.text);
    }

    fn lifecycle(&self, label: &str, message: &str) {
        self.write_line(label, Color::Green, message);
    }
}
