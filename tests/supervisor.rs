use std::sync::Arc;
use std::time::Duration;

use devherd::supervisor::{LaunchSpec, LifecycleGuard, ProcessSupervisor, ServiceState};
use devherd_test_utils::{RecordingSink, init_tracing, with_timeout};

fn launch(cmd: &[&str]) -> LaunchSpec {
    let cmd: Vec<String> = cmd.iter().map(|s| s.to_string()).collect();
    LaunchSpec::from_command(&cmd, None).unwrap()
}

fn supervisor() -> (ProcessSupervisor, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::new());
    (ProcessSupervisor::new(sink.clone()), sink)
}

#[tokio::test]
async fn output_lines_are_labelled_and_followed_by_exit_and_close() {
    init_tracing();
    let (supervisor, sink) = supervisor();

    let info = supervisor.spawn(
        "api",
        launch(&["sh", "-c", "printf 'one\\n\\ntwo   \\n'; echo oops >&2; exit 3"]),
    );
    assert_eq!(info.state, ServiceState::Running);
    assert!(info.pid.is_some());

    with_timeout(supervisor.wait_idle()).await;

    let lines = sink.lines();
    assert!(lines.contains(&"api: one".to_string()), "{lines:?}");
    assert!(lines.contains(&"api: two".to_string()), "{lines:?}");
    assert!(lines.contains(&"api: oops".to_string()), "{lines:?}");
    assert!(!lines.iter().any(|l| l == "api: "), "empty line forwarded: {lines:?}");

    let exit = lines
        .iter()
        .position(|l| l == "api: End of process with exit code 3")
        .expect("exit line");
    let close = lines
        .iter()
        .position(|l| l == "api: Done with exit code 3")
        .expect("close line");
    assert!(exit < close);
    assert_eq!(close, lines.len() - 1);

    let info = supervisor.get("api").unwrap();
    assert_eq!(info.state, ServiceState::Exited);
    assert_eq!(info.exit_code, Some(3));
}

#[tokio::test]
async fn stderr_records_keep_their_channel() {
    init_tracing();
    let (supervisor, sink) = supervisor();

    supervisor.spawn("worker", launch(&["sh", "-c", "echo err >&2"]));
    with_timeout(supervisor.wait_idle()).await;

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].label, "worker");
    assert_eq!(records[0].channel, devherd::output::Channel::Stderr);
    assert_eq!(records[0].text, "err");
}

#[tokio::test]
async fn restart_terminates_previous_instance() {
    init_tracing();
    let (supervisor, sink) = supervisor();

    let first = supervisor.spawn("api", launch(&["sleep", "30"]));
    assert_eq!(first.state, ServiceState::Running);

    let second = supervisor.spawn("api", launch(&["sh", "-c", "echo second"]));
    assert!(second.generation > first.generation);

    // Only one entry per name, and it is the new one.
    let services = supervisor.services();
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].generation, second.generation);

    // The old sleep got SIGTERM; otherwise this would block for 30s.
    with_timeout(supervisor.wait_idle()).await;
    assert!(sink.contains("api: second"));
    assert!(sink.contains("api: End of process with exit code none (terminated by signal)"));

    // The old process exiting must not overwrite the new entry.
    let info = supervisor.get("api").unwrap();
    assert_eq!(info.generation, second.generation);
    assert_eq!(info.exit_code, Some(0));
}

#[tokio::test]
async fn spawn_failure_is_recorded_not_returned() {
    init_tracing();
    let (supervisor, sink) = supervisor();

    let info = supervisor.spawn("ghost", launch(&["devherd-no-such-program-for-tests"]));
    assert_eq!(info.state, ServiceState::Exited);
    assert_eq!(info.exit_code, Some(-1));
    assert_eq!(supervisor.live_count(), 0);

    let lines = sink.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].starts_with("ghost: Failed to spawn service 'ghost'"), "{lines:?}");

    with_timeout(supervisor.wait_idle()).await;
}

#[tokio::test]
async fn kill_all_signals_each_live_service_once() {
    init_tracing();
    let (supervisor, _sink) = supervisor();

    assert_eq!(supervisor.kill_all(), 0);

    supervisor.spawn("a", launch(&["sleep", "30"]));
    supervisor.spawn("b", launch(&["sleep", "30"]));
    assert_eq!(supervisor.live_count(), 2);

    assert_eq!(supervisor.kill_all(), 2);
    assert_eq!(supervisor.kill_all(), 0);

    with_timeout(supervisor.wait_idle()).await;
    assert_eq!(supervisor.live_count(), 0);
}

#[tokio::test]
async fn guard_drop_terminates_services_once() {
    init_tracing();
    let (supervisor, sink) = supervisor();
    supervisor.spawn("api", launch(&["sleep", "30"]));

    {
        let guard = LifecycleGuard::new(Arc::new(supervisor.clone()));
        assert_eq!(guard.shutdown(), 1);
        assert_eq!(guard.shutdown(), 0);
    }

    with_timeout(supervisor.wait_idle()).await;
    let closed = "api: Done with exit code none (terminated by signal)";
    assert!(sink.wait_for_line(closed, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn request_exit_wakes_waiters() {
    let (supervisor, _sink) = supervisor();
    let guard = Arc::new(LifecycleGuard::new(Arc::new(supervisor)));
    assert!(!guard.is_exit_requested());

    let waiter = {
        let guard = guard.clone();
        tokio::spawn(async move { guard.exit_requested().await })
    };
    guard.request_exit();

    with_timeout(waiter).await.unwrap();
    assert!(guard.is_exit_requested());
}
