use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use devherd::config::Project;
use devherd::fs::{FileSystem, RealFileSystem};
use devherd::harness::{ModuleRegistry, RunOutcome, SuiteEngine, TestRunner};
use devherd_test_utils::{
    ProjectFileBuilder, init_tracing, with_timeout, write_service, write_suite,
};
use tempfile::TempDir;

const SMOKE: &str = r#"
include = ["../fixtures/env.toml"]

[env]
GREETING = "hello"

[[case]]
name = "greets"
cmd = "echo $GREETING from $ORIGIN"
stdout_matches = "^hello from fixture"

[[case]]
name = "runs in service dir"
cmd = "test -d config"

[[case]]
name = "reports exit code"
cmd = "echo broken >&2; exit 2"
expect_exit = 1

[[case]]
name = "too slow"
cmd = "sleep 2"
timeout = "100ms"
"#;

fn project(dir: &TempDir) -> (Project, Arc<dyn FileSystem>) {
    let root = dir.path();
    ProjectFileBuilder::new(&["node", "server.js"])
        .write_to(root)
        .unwrap();
    write_service(root, "api", "development").unwrap();
    write_suite(
        root,
        "api",
        "fixtures/env.toml",
        "[env]\nORIGIN = \"fixture\"\n",
    )
    .unwrap();

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let project = Project::load(fs.as_ref(), &root.join("Devherd.toml"), None).unwrap();
    (project, fs)
}

fn runner(project: &Project, fs: &Arc<dyn FileSystem>) -> TestRunner {
    let cwd = project.service_dir("api").unwrap().to_path_buf();
    let factory = SuiteEngine::factory(fs.clone(), Some(cwd), Duration::from_secs(5));
    TestRunner::new(Arc::new(ModuleRegistry::new()), factory)
}

fn rewrite(root: &Path, rel: &str, contents: &str) {
    write_suite(root, "api", rel, contents).unwrap();
}

#[tokio::test]
async fn suite_cases_run_as_shell_commands() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (project, fs) = project(&dir);
    rewrite(dir.path(), "tests/smoke.toml", SMOKE);

    // The fixture lives outside the test glob.
    let files = project.test_files(fs.as_ref(), "api").unwrap();
    assert_eq!(files.len(), 1, "{files:?}");

    let report = with_timeout(runner(&project, &fs).run_tests(&files)).await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.summary.passed, 2);
    assert_eq!(report.summary.failed, 2);

    let by_name = |name: &str| {
        report
            .summary
            .failures
            .iter()
            .find(|f| f.test == name)
            .unwrap_or_else(|| panic!("no failure for {name}: {:?}", report.summary.failures))
            .message
            .clone()
    };
    let exit = by_name("reports exit code");
    assert!(exit.contains("expected exit code 1, got 2"), "{exit}");
    assert!(exit.contains("stderr: broken"), "{exit}");
    assert!(by_name("too slow").contains("timed out"));
}

#[tokio::test]
async fn edits_are_picked_up_by_the_next_run() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (project, fs) = project(&dir);
    rewrite(
        dir.path(),
        "tests/smoke.toml",
        "[[case]]\nname = \"flips\"\ncmd = \"exit 1\"\n",
    );
    let runner = runner(&project, &fs);
    let files = project.test_files(fs.as_ref(), "api").unwrap();

    let first = with_timeout(runner.run_tests(&files)).await;
    assert_eq!(first.outcome, RunOutcome::Failed);
    assert!(!first.evicted.is_empty());

    rewrite(
        dir.path(),
        "tests/smoke.toml",
        "[[case]]\nname = \"flips\"\ncmd = \"exit 0\"\n",
    );
    let second = with_timeout(runner.run_tests(&files)).await;
    assert_eq!(second.outcome, RunOutcome::Passed);
    assert!(runner.modules().is_empty());
}

#[tokio::test]
async fn timed_out_case_takes_its_background_jobs_with_it() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (project, fs) = project(&dir);
    rewrite(
        dir.path(),
        "tests/slow.toml",
        "[[case]]\nname = \"forks\"\ncmd = \"(sleep 1; touch survived) & sleep 17\"\n\
         timeout = \"100ms\"\n",
    );
    let files = project.test_files(fs.as_ref(), "api").unwrap();

    let started = Instant::now();
    let report = with_timeout(runner(&project, &fs).run_tests(&files)).await;
    assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());

    assert_eq!(report.outcome, RunOutcome::Failed);
    assert_eq!(report.summary.failed, 1);
    assert!(report.summary.failures[0].message.contains("timed out"));

    // The background subshell would have touched the file after one second.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let service = project.service_dir("api").unwrap();
    assert!(!service.join("survived").exists());
}

#[tokio::test]
async fn malformed_suite_aborts_the_run() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let (project, fs) = project(&dir);
    rewrite(dir.path(), "tests/broken.toml", "[[case]\nname = ");

    let files = project.test_files(fs.as_ref(), "api").unwrap();
    let runner = runner(&project, &fs);
    let report = with_timeout(runner.run_tests(&files)).await;

    match &report.outcome {
        RunOutcome::Aborted(reason) => assert!(reason.contains("parsing test file"), "{reason}"),
        other => panic!("expected Aborted, got {other:?}"),
    }
    assert_eq!(report.summary.passed + report.summary.failed, 0);
    assert!(runner.modules().is_empty());
}
