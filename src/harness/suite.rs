// src/harness/suite.rs

//! TOML test suites executed as shell commands.
//!
//! ```toml
//! include = ["../fixtures/env.toml"]
//!
//! [env]
//! API_URL = "http://localhost:3000"
//!
//! [[case]]
//! name = "prints version"
//! cmd = "node --version"
//! expect_exit = 0
//! stdout_matches = "^v\\d+"
//! timeout = "10s"
//! ```
//!
//! Suite files and their includes are loaded through the module registry, so
//! within one run each file is parsed once and a later run sees edits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use futures::FutureExt;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::parse_duration;
use crate::fs::FileSystem;
use crate::harness::engine::{
    EngineContext, EngineEvent, EngineFactory, EngineHandle, EngineRun, RunSummary, TestEngine,
};
use crate::harness::fault::{Fault, FaultScope};
use crate::harness::modules::{ModuleId, ModuleRegistry};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSuite {
    #[serde(default)]
    include: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default, rename = "case")]
    cases: Vec<RawCase>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCase {
    name: String,
    cmd: String,
    #[serde(default)]
    expect_exit: i32,
    stdout_matches: Option<String>,
    stderr_matches: Option<String>,
    timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFixture {
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// Shared fixture module: an environment table.
#[derive(Debug)]
pub struct Fixture {
    pub env: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct Case {
    pub name: String,
    pub cmd: String,
    pub expect_exit: i32,
    pub stdout_matches: Option<Regex>,
    pub stderr_matches: Option<Regex>,
    pub timeout: Duration,
}

/// A parsed suite file with its includes already merged into `env`.
#[derive(Debug)]
pub struct Suite {
    pub path: PathBuf,
    pub env: BTreeMap<String, String>,
    pub cases: Vec<Case>,
}

#[derive(Debug, Clone)]
pub struct SuiteEngine {
    fs: Arc<dyn FileSystem>,
    cwd: Option<PathBuf>,
    default_timeout: Duration,
    files: Vec<PathBuf>,
}

impl SuiteEngine {
    pub fn new(fs: Arc<dyn FileSystem>, cwd: Option<PathBuf>, default_timeout: Duration) -> Self {
        Self {
            fs,
            cwd,
            default_timeout,
            files: Vec::new(),
        }
    }

    /// Factory producing a fresh engine with the same settings for every run.
    pub fn factory(
        fs: Arc<dyn FileSystem>,
        cwd: Option<PathBuf>,
        default_timeout: Duration,
    ) -> EngineFactory {
        Arc::new(move || {
            let engine = SuiteEngine::new(fs.clone(), cwd.clone(), default_timeout);
            Box::new(engine) as Box<dyn TestEngine>
        })
    }

    fn load_suite(&self, modules: &ModuleRegistry, path: &Path) -> Result<Arc<Suite>> {
        let canonical = self
            .fs
            .canonicalize(path)
            .with_context(|| format!("test file {:?} not found", path))?;
        let id = ModuleId::from_path(&canonical);

        modules.load(&id, || {
            let text = self.fs.read_to_string(&canonical)?;
            let raw: RawSuite =
                toml::from_str(&text).with_context(|| format!("parsing test file {:?}", path))?;

            let mut env = BTreeMap::new();
            let base = canonical.parent().map(Path::to_path_buf).unwrap_or_default();
            for include in &raw.include {
                let fixture = self.load_fixture(modules, &base.join(include))?;
                env.extend(fixture.env.clone());
            }
            env.extend(raw.env);

            let cases = raw
                .cases
                .into_iter()
                .map(|case| self.compile_case(case))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("in test file {:?}", path))?;

            Ok(Suite {
                path: path.to_path_buf(),
                env,
                cases,
            })
        })
    }

    fn load_fixture(&self, modules: &ModuleRegistry, path: &Path) -> Result<Arc<Fixture>> {
        let canonical = self
            .fs
            .canonicalize(path)
            .with_context(|| format!("included file {:?} not found", path))?;
        let id = ModuleId::from_path(&canonical);

        modules.load(&id, || {
            let text = self.fs.read_to_string(&canonical)?;
            let raw: RawFixture =
                toml::from_str(&text).with_context(|| format!("parsing included file {:?}", path))?;
            Ok(Fixture { env: raw.env })
        })
    }

    fn compile_case(&self, raw: RawCase) -> Result<Case> {
        let pattern = |p: Option<String>| -> Result<Option<Regex>> {
            p.map(|p| Regex::new(&p).with_context(|| format!("case '{}': invalid regex", raw.name)))
                .transpose()
        };
        let stdout_matches = pattern(raw.stdout_matches.clone())?;
        let stderr_matches = pattern(raw.stderr_matches.clone())?;

        let timeout = match &raw.timeout {
            Some(t) => parse_duration(t).map_err(|e| anyhow!("case '{}': {e}", raw.name))?,
            None => self.default_timeout,
        };

        Ok(Case {
            name: raw.name,
            cmd: raw.cmd,
            expect_exit: raw.expect_exit,
            stdout_matches,
            stderr_matches,
            timeout,
        })
    }
}

impl TestEngine for SuiteEngine {
    fn add_file(&mut self, path: PathBuf) {
        self.files.push(path);
    }

    fn run(self: Box<Self>, ctx: EngineContext) -> Result<EngineRun> {
        let suites = self
            .files
            .iter()
            .map(|path| self.load_suite(&ctx.modules, path))
            .collect::<Result<Vec<_>>>()?;
        let total = suites.iter().map(|s| s.cases.len()).sum();

        let state = Arc::new(SuiteState::default());
        let handle: Arc<dyn EngineHandle> = state.clone();
        let cwd = self.cwd.clone();
        let EngineContext { scope, events, .. } = ctx;

        let done = async move {
            let _ = events.send(EngineEvent::Start { total });
            for suite in &suites {
                debug!(suite = ?suite.path, cases = suite.cases.len(), "running suite");
                for case in &suite.cases {
                    run_one(&state, &scope, &events, suite, case, cwd.as_deref()).await;
                }
            }
            let summary = state.summary();
            let _ = events.send(EngineEvent::End(summary.clone()));
            summary
        }
        .boxed();

        Ok(EngineRun { handle, done })
    }
}

/// Per-run bookkeeping, also the run's [`EngineHandle`].
#[derive(Default)]
struct SuiteState {
    current: Mutex<Option<String>>,
    /// Faults attributed to the current case.
    pending: Mutex<Vec<String>>,
    summary: Mutex<RunSummary>,
}

impl SuiteState {
    fn begin(&self, name: &str) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(name.to_string());
    }

    fn finish(&self) -> Vec<String> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn summary(&self) -> RunSummary {
        self.summary.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl EngineHandle for SuiteState {
    fn uncaught(&self, fault: Fault) {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.is_some() {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(fault.to_string());
        } else {
            self.summary
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record_failure("<uncaught>", fault.to_string());
        }
    }
}

async fn run_one(
    state: &SuiteState,
    scope: &FaultScope,
    events: &mpsc::UnboundedSender<EngineEvent>,
    suite: &Suite,
    case: &Case,
    cwd: Option<&Path>,
) {
    let started = Instant::now();
    state.begin(&case.name);
    let _ = events.send(EngineEvent::CaseStarted {
        name: case.name.clone(),
    });

    let mut result = run_case(scope, &suite.env, case, cwd).await;

    // Let the boundary deliver faults raised by this case's tasks.
    tokio::task::yield_now().await;
    let faults = state.finish();
    if result.is_ok() && !faults.is_empty() {
        result = Err(faults.join("; "));
    }

    let mut summary = state.summary.lock().unwrap_or_else(|e| e.into_inner());
    match result {
        Ok(()) => {
            summary.record_pass();
            let duration = started.elapsed();
            info!(case = %case.name, ?duration, "case passed");
            let _ = events.send(EngineEvent::CasePassed {
                name: case.name.clone(),
                duration,
            });
        }
        Err(message) => {
            summary.record_failure(&case.name, &message);
            info!(case = %case.name, %message, "case failed");
            let _ = events.send(EngineEvent::CaseFailed {
                name: case.name.clone(),
                message,
            });
        }
    }
}

async fn run_case(
    scope: &FaultScope,
    env: &BTreeMap<String, String>,
    case: &Case,
    cwd: Option<&Path>,
) -> std::result::Result<(), String> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&case.cmd)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    // Own group, so a timeout reaches everything the shell started.
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to start '{}': {e}", case.cmd))?;

    let stdout = child.stdout.take().map(|out| scope.spawn(read_all(out)));
    let stderr = child.stderr.take().map(|err| scope.spawn(read_all(err)));

    let status = match tokio::time::timeout(case.timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(format!("waiting for '{}' failed: {e}", case.cmd)),
        Err(_) => {
            if let Some(pid) = child.id() {
                kill_group(pid);
            }
            let _ = child.kill().await;
            // Readers may still be blocked on pipes held open by stragglers.
            for reader in [&stdout, &stderr].into_iter().flatten() {
                reader.abort();
            }
            return Err(format!("timed out after {:?}", case.timeout));
        }
    };

    let stdout = collect(stdout).await;
    let stderr = collect(stderr).await;

    let code = status.code();
    if code != Some(case.expect_exit) {
        let got = code.map_or_else(|| "a signal".to_string(), |c| c.to_string());
        let mut message = format!("expected exit code {}, got {got}", case.expect_exit);
        let stderr_tail = stderr.trim();
        if !stderr_tail.is_empty() {
            message.push_str(&format!("\nstderr: {stderr_tail}"));
        }
        return Err(message);
    }

    check_output("stdout", &case.stdout_matches, &stdout)?;
    check_output("stderr", &case.stderr_matches, &stderr)?;
    Ok(())
}

#[cfg(unix)]
fn kill_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pid, error = %err, "failed to kill case process group");
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) {}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> Result<String> {
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .context("reading case output")?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn collect(handle: Option<tokio::task::JoinHandle<Option<String>>>) -> String {
    match handle {
        Some(handle) => handle.await.ok().flatten().unwrap_or_default(),
        None => String::new(),
    }
}

fn check_output(
    stream: &str,
    pattern: &Option<Regex>,
    output: &str,
) -> std::result::Result<(), String> {
    match pattern {
        Some(re) if !re.is_match(output) => Err(format!(
            "{stream} did not match /{}/; got: {}",
            re.as_str(),
            output.trim()
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    fn engine(fs: &MockFileSystem) -> SuiteEngine {
        SuiteEngine::new(Arc::new(fs.clone()), None, Duration::from_secs(5))
    }

    #[test]
    fn includes_are_merged_before_suite_env() {
        let fs = MockFileSystem::new();
        fs.add_file(
            "svc/fixtures/env.toml",
            "[env]\nAPI_URL = \"http://fixture\"\nMODE = \"fixture\"\n",
        );
        fs.add_file(
            "svc/tests/a.toml",
            r#"
            include = ["../fixtures/env.toml"]

            [env]
            MODE = "suite"

            [[case]]
            name = "echo"
            cmd = "echo hi"
            stdout_matches = "hi"
            timeout = "2s"
            "#,
        );

        let modules = ModuleRegistry::new();
        let suite = engine(&fs)
            .load_suite(&modules, Path::new("svc/tests/a.toml"))
            .unwrap();

        assert_eq!(suite.env.get("API_URL").map(String::as_str), Some("http://fixture"));
        assert_eq!(suite.env.get("MODE").map(String::as_str), Some("suite"));
        assert_eq!(suite.cases.len(), 1);
        assert_eq!(suite.cases[0].timeout, Duration::from_secs(2));
        assert!(modules.contains(&ModuleId::from("svc/fixtures/env.toml")));
        assert!(modules.contains(&ModuleId::from("svc/tests/a.toml")));
    }

    #[test]
    fn malformed_suite_is_an_error_and_not_cached() {
        let fs = MockFileSystem::new();
        fs.add_file("svc/tests/bad.toml", "[[case]]\nname = \"no cmd\"\n");

        let modules = ModuleRegistry::new();
        let err = engine(&fs)
            .load_suite(&modules, Path::new("svc/tests/bad.toml"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("parsing test file"));
        assert!(modules.is_empty());
    }

    #[test]
    fn invalid_regex_names_the_case() {
        let fs = MockFileSystem::new();
        fs.add_file(
            "t.toml",
            "[[case]]\nname = \"broken\"\ncmd = \"true\"\nstdout_matches = \"(\"\n",
        );
        let err = engine(&fs)
            .load_suite(&ModuleRegistry::new(), Path::new("t.toml"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("case 'broken'"));
    }

    #[test]
    fn check_output_reports_mismatch() {
        let re = Some(Regex::new("^v\\d+").unwrap());
        assert!(check_output("stdout", &re, "v20.1.0\n").is_ok());
        assert!(check_output("stdout", &re, "nope").is_err());
        assert!(check_output("stdout", &None, "anything").is_ok());
    }
}
