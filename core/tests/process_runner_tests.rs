/// Integration tests for the process runner.
///
/// Covers exit classification, timeouts with process-group termination,
/// cancellation, forced kill after the grace period and live streaming.
use std::time::Instant;
use testmesh_core::{CommandSpec, ProcessRunner, RunHandle, RunStatus};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

#[cfg(unix)]
fn process_gone(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    matches!(killpg(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

#[tokio::test]
async fn test_nonzero_exit_is_failure_not_timeout() {
    let runner = ProcessRunner::new();
    let spec = CommandSpec::new("exit 1").with_timeout(Duration::from_secs(10));

    let outcome = runner.run(&spec, &RunHandle::new(), None).await;

    assert_eq!(outcome.status, RunStatus::Failure);
    assert_eq!(outcome.exit_code, Some(1));
    assert!(outcome.duration < Duration::from_secs(1));
}

#[tokio::test]
async fn test_missing_command_is_error() {
    let runner = ProcessRunner::new();
    let spec = CommandSpec::new("testmesh-no-such-binary --flag");

    let outcome = runner.run(&spec, &RunHandle::new(), None).await;

    assert_eq!(outcome.status, RunStatus::Error);
    assert_eq!(outcome.exit_code, Some(127));
}

#[tokio::test]
async fn test_command_exiting_127_itself_is_failure() {
    let runner = ProcessRunner::new();
    let spec = CommandSpec::new("echo 'collected 0 items'; exit 127");

    let outcome = runner.run(&spec, &RunHandle::new(), None).await;

    assert_eq!(outcome.status, RunStatus::Failure);
    assert_eq!(outcome.exit_code, Some(127));
    assert_eq!(outcome.error.as_deref(), Some("Exited with code 127"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_timeout_terminates_process() {
    let runner = ProcessRunner::new();
    let spec = CommandSpec::new("sleep 100").with_timeout(Duration::from_secs(1));

    let started = Instant::now();
    let outcome = runner.run(&spec, &RunHandle::new(), None).await;

    assert_eq!(outcome.status, RunStatus::Timeout);
    assert!(outcome.error.is_some());
    assert!(started.elapsed() < Duration::from_secs(1) + runner.grace_period());

    let pid = outcome.pid.unwrap();
    let mut gone = process_gone(pid);
    for _ in 0..50 {
        if gone {
            break;
        }
        sleep(Duration::from_millis(100)).await;
        gone = process_gone(pid);
    }
    assert!(gone, "process group {} still alive", pid);
}

#[tokio::test]
async fn test_cancel_running_process() {
    let runner = ProcessRunner::new();
    let handle = RunHandle::new();
    let spec = CommandSpec::new("sleep 30").with_timeout(Duration::from_secs(60));

    let task = {
        let runner = runner.clone();
        let handle = handle.clone();
        tokio::spawn(async move { runner.run(&spec, &handle, None).await })
    };

    sleep(Duration::from_millis(200)).await;
    runner.cancel(&handle);
    runner.cancel(&handle);

    let outcome = timeout(Duration::from_secs(10), task)
        .await
        .expect("run did not finish after cancel")
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_ignored_is_force_killed() {
    let runner = ProcessRunner::with_grace_period(Duration::from_millis(500));
    let handle = RunHandle::new();
    let spec = CommandSpec::new("trap '' TERM; sleep 30");

    let task = {
        let runner = runner.clone();
        let handle = handle.clone();
        tokio::spawn(async move { runner.run(&spec, &handle, None).await })
    };

    sleep(Duration::from_millis(200)).await;
    let cancelled_at = Instant::now();
    handle.cancel();

    let outcome = timeout(Duration::from_secs(10), task)
        .await
        .expect("run did not finish after SIGKILL")
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(cancelled_at.elapsed() >= Duration::from_millis(500));
}

#[tokio::test]
async fn test_lines_stream_before_exit() {
    let runner = ProcessRunner::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let spec = CommandSpec::new("echo first; sleep 2; echo second");

    let task = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run(&spec, &RunHandle::new(), Some(tx)).await })
    };

    let first = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("first line not streamed")
        .unwrap();
    assert_eq!(first, "first");
    assert!(!task.is_finished());

    let outcome = task.await.unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.output, "first\nsecond\n");
    assert_eq!(rx.recv().await.as_deref(), Some("second"));
}
