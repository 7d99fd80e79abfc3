use std::sync::Mutex;
use std::time::Duration;

use devherd::output::{LogRecord, LogSink};

/// Sink that keeps every line in memory, formatted as `<label>: <text>`.
#[derive(Default)]
pub struct RecordingSink {
    records: Mutex<Vec<LogRecord>>,
    lines: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Output and lifecycle lines in arrival order.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, line: &str) -> bool {
        self.lines.lock().unwrap().iter().any(|l| l == line)
    }

    /// Poll until `line` shows up or `timeout` passes.
    pub async fn wait_for_line(&self, line: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.contains(line) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl LogSink for RecordingSink {
    fn record(&self, record: &LogRecord) {
        self.lines
            .lock()
            .unwrap()
            .push(format!("{}: {}", record.label, record.text));
        self.records.lock().unwrap().push(record.clone());
    }

    fn lifecycle(&self, label: &str, message: &str) {
        self.lines.lock().unwrap().push(format!("{label}: {message}"));
    }
}
