// src/harness/reporter.rs

use std::io::{self, Stdout, Write};

use colored::Colorize;
use tokio::sync::mpsc;

use crate::harness::engine::EngineEvent;
use crate::harness::runner::{RunEvent, RunOutcome};

/// Prints run events as an indented pass/fail list followed by a summary.
pub struct SpecReporter<W: Write = Stdout> {
    output: W,
    failures: usize,
}

impl<W: Write> SpecReporter<W> {
    pub fn new(output: W) -> Self {
        Self {
            output,
            failures: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.output
    }

    pub fn handle(&mut self, event: &RunEvent) {
        let _ = self.write_event(event);
        let _ = self.output.flush();
    }

    fn write_event(&mut self, event: &RunEvent) -> io::Result<()> {
        match event {
            RunEvent::Engine(EngineEvent::Start { total }) => {
                writeln!(self.output)?;
                writeln!(self.output, "  running {total} test(s)")?;
            }
            RunEvent::Engine(EngineEvent::CaseStarted { .. }) => {}
            RunEvent::Engine(EngineEvent::CasePassed { name, duration }) => {
                writeln!(
                    self.output,
                    "    {} {name} ({}ms)",
                    "✓".green(),
                    duration.as_millis()
                )?;
            }
            RunEvent::Engine(EngineEvent::CaseFailed { name, .. }) => {
                self.failures += 1;
                writeln!(self.output, "    {}", format!("{}) {name}", self.failures).red())?;
            }
            RunEvent::Engine(EngineEvent::End(_)) => {}
            RunEvent::Uncaught(message) => {
                writeln!(self.output, "    {} {message}", "uncaught:".red())?;
            }
            RunEvent::End { outcome, summary } => {
                writeln!(self.output)?;
                writeln!(self.output, "  {}", format!("{} passing", summary.passed).green())?;
                if summary.failed > 0 {
                    writeln!(self.output, "  {}", format!("{} failing", summary.failed).red())?;
                }
                for (i, failure) in summary.failures.iter().enumerate() {
                    writeln!(self.output)?;
                    writeln!(self.output, "  {}) {}:", i + 1, failure.test)?;
                    for line in failure.message.lines() {
                        writeln!(self.output, "     {}", line.red())?;
                    }
                }
                if let RunOutcome::Aborted(reason) = outcome {
                    writeln!(self.output)?;
                    writeln!(self.output, "  {} {reason}", "aborted:".red())?;
                }
                writeln!(self.output)?;
                self.failures = 0;
            }
        }
        Ok(())
    }

    /// Print events until the channel closes.
    pub async fn drive(mut self, mut rx: mpsc::UnboundedReceiver<RunEvent>) -> W {
        while let Some(event) = rx.recv().await {
            self.handle(&event);
        }
        self.output
    }
}

impl SpecReporter {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::engine::RunSummary;
    use std::time::Duration;

    #[test]
    fn prints_cases_and_failure_details() {
        let mut reporter = SpecReporter::new(Vec::new());
        let mut summary = RunSummary::default();
        summary.record_pass();
        summary.record_failure("rejects bad input", "expected exit code 1, got 0");

        for event in [
            RunEvent::Engine(EngineEvent::Start { total: 2 }),
            RunEvent::Engine(EngineEvent::CasePassed {
                name: "prints version".into(),
                duration: Duration::from_millis(12),
            }),
            RunEvent::Engine(EngineEvent::CaseFailed {
                name: "rejects bad input".into(),
                message: "expected exit code 1, got 0".into(),
            }),
            RunEvent::End {
                outcome: RunOutcome::Failed,
                summary,
            },
        ] {
            reporter.handle(&event);
        }

        let output = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(output.contains("running 2 test(s)"));
        assert!(output.contains(&format!("{} prints version (12ms)", "✓".green())));
        assert!(output.contains(&format!("{}", "1) rejects bad input".red())));
        assert!(output.contains(&format!("{}", "1 passing".green())));
        assert!(output.contains(&format!("{}", "1 failing".red())));
        assert!(output.contains("  1) rejects bad input:"));
    }

    #[test]
    fn aborted_runs_show_the_reason() {
        let mut reporter = SpecReporter::new(Vec::new());
        reporter.handle(&RunEvent::End {
            outcome: RunOutcome::Aborted("parsing test file".into()),
            summary: RunSummary::default(),
        });
        let output = String::from_utf8(reporter.into_inner()).unwrap();
        assert!(output.contains("parsing test file"));
    }
}
