// src/lib.rs

pub mod cli;
pub mod config;
pub mod errors;
pub mod fs;
pub mod harness;
pub mod logging;
pub mod output;
pub mod supervisor;
pub mod watch;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cli::{CliArgs, Command};
use crate::config::Project;
use crate::errors::DevherdError;
use crate::fs::{FileSystem, RealFileSystem};
use crate::harness::{ModuleRegistry, RunReport, SpecReporter, SuiteEngine, TestRunner};
use crate::output::ConsoleSink;
use crate::supervisor::{LaunchSpec, LifecycleGuard, NoProcesses, ProcessSupervisor, parse_port};
use crate::watch::{WatchEvent, profiles_for_services, spawn_watcher};

/// How long `serve` waits for services to finish after signalling them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - project loading and service discovery
/// - the process supervisor and its lifecycle guard (`serve`)
/// - the test runner and reporter (`test`)
/// - (optional) the file watcher
pub async fn run(args: CliArgs) -> Result<ExitCode> {
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let project_path = PathBuf::from(&args.project);
    let project = Project::load(fs.as_ref(), &project_path, args.profile.as_deref())?;

    match args.command.unwrap_or(Command::List) {
        Command::List => {
            print_listing(&project, fs.as_ref());
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve { services, watch } => serve(&project, fs.as_ref(), &services, watch).await,
        Command::Test { service, watch } => test(&project, fs, &service, watch).await,
    }
}

async fn serve(
    project: &Project,
    fs: &dyn FileSystem,
    services: &[String],
    watch: bool,
) -> Result<ExitCode> {
    let port = port_override(project, services.len())?;

    // Resolve everything before the first process starts.
    let specs = services
        .iter()
        .map(|name| Ok((name.clone(), project.launch_spec(fs, name, port)?)))
        .collect::<std::result::Result<Vec<(String, LaunchSpec)>, DevherdError>>()?;

    let supervisor = ProcessSupervisor::new(Arc::new(ConsoleSink::stdout()));
    let guard = LifecycleGuard::install(Arc::new(supervisor.clone()));

    for (name, spec) in specs {
        supervisor.spawn(&name, spec);
    }

    if watch {
        let (tx, mut rx) = mpsc::channel::<WatchEvent>(16);
        let profiles = profiles_for_services(project, services.iter().map(String::as_str))?;
        let _watcher = spawn_watcher(watch_root(project), profiles, tx)?;

        loop {
            tokio::select! {
                _ = guard.exit_requested() => break,
                Some(WatchEvent::Changed { target }) = rx.recv() => {
                    match project.launch_spec(fs, &target, port) {
                        Ok(spec) => {
                            info!(service = %target, "change detected; restarting");
                            supervisor.spawn(&target, spec);
                        }
                        Err(e) => error!(service = %target, error = %e, "cannot restart service"),
                    }
                }
            }
        }
    } else {
        tokio::select! {
            _ = guard.exit_requested() => {}
            _ = supervisor.wait_idle() => info!("all services closed"),
        }
    }

    guard.shutdown();
    if tokio::time::timeout(SHUTDOWN_GRACE, supervisor.wait_idle())
        .await
        .is_err()
    {
        warn!(
            live = supervisor.live_count(),
            "services still running after shutdown grace period"
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn test(
    project: &Project,
    fs: Arc<dyn FileSystem>,
    service: &str,
    watch: bool,
) -> Result<ExitCode> {
    let service_dir = project.service_dir(service)?.to_path_buf();
    let mut files = project.test_files(fs.as_ref(), service)?;
    if files.is_empty() {
        warn!(%service, "no test files matched");
    }

    let factory = SuiteEngine::factory(
        fs.clone(),
        Some(service_dir),
        project.file().test_timeout(),
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let reporter = tokio::spawn(SpecReporter::stdout().drive(rx));
    let runner = TestRunner::new(Arc::new(ModuleRegistry::new()), factory).with_events(tx);

    // No services are started here; the guard only carries interrupts.
    let guard = LifecycleGuard::install(Arc::new(NoProcesses));

    let mut last: Option<RunReport> = tokio::select! {
        report = runner.run_tests(&files) => Some(report),
        _ = guard.exit_requested() => None,
    };

    if watch && last.is_some() {
        let (watch_tx, mut watch_rx) = mpsc::channel::<WatchEvent>(16);
        let profiles = profiles_for_services(project, [service])?;
        let _watcher = spawn_watcher(watch_root(project), profiles, watch_tx)?;

        loop {
            tokio::select! {
                _ = guard.exit_requested() => break,
                Some(WatchEvent::Changed { .. }) = watch_rx.recv() => {
                    match project.test_files(fs.as_ref(), service) {
                        Ok(found) => files = found,
                        Err(e) => warn!(%service, error = %e, "keeping previous test file list"),
                    }
                    tokio::select! {
                        report = runner.run_tests(&files) => last = Some(report),
                        _ = guard.exit_requested() => break,
                    }
                }
            }
        }
    }

    guard.shutdown();
    drop(runner);
    if let Err(e) = reporter.await {
        warn!(error = %e, "reporter task failed");
    }

    let passed = last.is_some_and(|report| report.outcome.is_passed());
    Ok(if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Port from the configured environment variable. Only one service can
/// take an explicit port.
fn port_override(project: &Project, services: usize) -> Result<Option<u16>> {
    let var = &project.file().config.port_env;
    let port = parse_port(var, std::env::var(var).ok().as_deref())?;
    if port.is_some() && services > 1 {
        return Err(DevherdError::ConfigError(format!(
            "{var} is set but {services} services were requested; \
             a port override applies to one service"
        ))
        .into());
    }
    Ok(port)
}

fn watch_root(project: &Project) -> PathBuf {
    match project.cwd() {
        Some(root) => root,
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

fn print_listing(project: &Project, fs: &dyn FileSystem) {
    println!("devherd");
    println!("  project root = {}", display_root(project.root()));
    println!("  profile      = {}", project.profile());
    println!();

    let names: Vec<&str> = project.service_names().collect();
    println!("services ({}):", names.len());
    for name in names {
        println!("  - {name}");
        match project.launch_spec(fs, name, None) {
            Ok(spec) => println!("      cmd: {}", spec.display()),
            Err(e) => println!("      cmd: unavailable ({e})"),
        }
        match project.test_files(fs, name) {
            Ok(files) => println!("      tests: {} file(s)", files.len()),
            Err(e) => println!("      tests: unavailable ({e})"),
        }
    }
    println!();

    println!("commands:");
    println!("  serve <SERVICE>... [--watch]   start services and stream their output");
    println!("  test <SERVICE> [--watch]       run a service's test suites");
    println!("  list                           show this overview");
}

fn display_root(root: &Path) -> String {
    if root.as_os_str().is_empty() {
        ".".to_string()
    } else {
        root.display().to_string()
    }
}
