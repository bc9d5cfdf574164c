#![cfg(unix)]

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pipesource::observer::FAILURE_MESSAGE;
use pipesource::prelude::*;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const INVALID_COMMAND: &str = "@@@Invalid_Command_Test@@@";

/// Observer that keeps every failure with the time it arrived
#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<(Instant, FailureEvent)>>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    fn events(&self) -> Vec<(Instant, FailureEvent)> {
        self.events.lock().unwrap().clone()
    }

    async fn wait_for(&self, n: usize, limit: Duration) {
        let deadline = Instant::now() + limit;
        while self.count() < n {
            assert!(Instant::now() < deadline, "expected {} failure events", n);
            sleep(Duration::from_millis(10)).await;
        }
    }
}

impl FailureObserver for Recorder {
    fn on_failure(&self, event: &FailureEvent) {
        self.events
            .lock()
            .unwrap()
            .push((Instant::now(), event.clone()));
    }
}

fn source(config: PipeConfig, capacity: usize) -> (PipeSource, mpsc::Receiver<Record>, Recorder) {
    let recorder = Recorder::default();
    let (source, rx) = PipeSource::channel(config, capacity).unwrap();
    (source.with_observer(recorder.clone()), rx, recorder)
}

async fn recv(rx: &mut mpsc::Receiver<Record>) -> Record {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a record")
        .expect("record channel closed")
}

async fn assert_quiet(rx: &mut mpsc::Receiver<Record>, window: Duration) {
    if let Ok(Some(record)) = timeout(window, rx.recv()).await {
        panic!("unexpected record: {:?}", record.message);
    }
}

async fn wait_stopped(source: &PipeSource) {
    timeout(Duration::from_secs(5), source.wait_stopped())
        .await
        .expect("source did not stop");
}

#[tokio::test]
async fn test_echo_once_with_never() {
    let config = PipeConfig::new("echo ☹").with_restart(RestartPolicy::Never);
    let (source, mut rx, recorder) = source(config, 16);

    source.start().await.unwrap();
    assert!(source.ready());

    let record = recv(&mut rx).await;
    assert_eq!(record.message, "☹");
    assert_eq!(record.command, "echo ☹");

    wait_stopped(&source).await;
    assert_quiet(&mut rx, Duration::from_millis(300)).await;
    assert!(source.ready());
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn test_echo_forever_with_always() {
    let config = PipeConfig::new("echo X")
        .with_restart(RestartPolicy::Always)
        .with_restart_delay(Duration::ZERO);
    let (source, mut rx, recorder) = source(config, 16);

    source.start().await.unwrap();

    let started = Instant::now();
    for _ in 0..10 {
        assert_eq!(recv(&mut rx).await.message, "X");
    }
    assert!(started.elapsed() < Duration::from_secs(2));

    source.stop().await.unwrap();
    assert_eq!(source.state(), SupervisorState::Stopped);
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn test_lines_arrive_in_order() {
    let config = PipeConfig::new("for i in 0 1 2 3 4; do echo \"$i ☹\"; done")
        .with_restart(RestartPolicy::Never);
    let (source, mut rx, _) = source(config, 16);
    source.start().await.unwrap();

    for i in 0..5u64 {
        let record = recv(&mut rx).await;
        assert_eq!(record.message, format!("{} ☹", i));
        assert_eq!(record.sequence, i);
    }

    wait_stopped(&source).await;
    assert_quiet(&mut rx, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_tail_follows_appended_lines() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let config = PipeConfig::new(format!("tail -n +0 -f {}", file.path().display()))
        .with_restart(RestartPolicy::Never);
    let (source, mut rx, _) = source(config, 16);

    source.start().await.unwrap();
    assert!(source.ready());

    for i in 0..10 {
        writeln!(file, "{} ☹", i).unwrap();
    }
    file.flush().unwrap();

    for i in 0..10 {
        assert_eq!(recv(&mut rx).await.message, format!("{} ☹", i));
    }

    let started = Instant::now();
    source.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(source.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_invalid_command_is_not_restarted_under_never() {
    let config = PipeConfig::new(INVALID_COMMAND).with_restart(RestartPolicy::Never);
    let (source, mut rx, recorder) = source(config, 16);

    source.start().await.unwrap();
    recorder.wait_for(1, Duration::from_secs(5)).await;
    wait_stopped(&source).await;

    // Nothing further shows up
    assert_quiet(&mut rx, Duration::from_millis(500)).await;
    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.message, FAILURE_MESSAGE);
    assert_eq!(events[0].1.kind, FailureKind::NonZeroExit);
}

#[tokio::test]
async fn test_invalid_command_retries_with_delay_under_on_error() {
    let delay = Duration::from_millis(300);
    let config = PipeConfig::new(INVALID_COMMAND)
        .with_restart(RestartPolicy::OnError)
        .with_restart_delay(delay);
    let (source, mut rx, recorder) = source(config, 16);

    source.start().await.unwrap();
    recorder.wait_for(3, Duration::from_secs(5)).await;
    source.stop().await.unwrap();

    let events = recorder.events();
    for pair in events.windows(2) {
        assert!(pair[1].0.duration_since(pair[0].0) >= delay);
        assert_eq!(pair[1].1.message, FAILURE_MESSAGE);
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_clean_exit_is_terminal_under_on_error() {
    let config = PipeConfig::new("echo done")
        .with_restart(RestartPolicy::OnError)
        .with_restart_delay(Duration::ZERO);
    let (source, mut rx, recorder) = source(config, 16);

    source.start().await.unwrap();
    assert_eq!(recv(&mut rx).await.message, "done");

    wait_stopped(&source).await;
    assert_quiet(&mut rx, Duration::from_millis(300)).await;
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn test_stop_interrupts_restart_delay() {
    let config = PipeConfig::new("exit 1")
        .with_restart(RestartPolicy::OnError)
        .with_restart_delay(Duration::from_secs(30));
    let (source, _rx, recorder) = source(config, 16);

    source.start().await.unwrap();
    recorder.wait_for(1, Duration::from_secs(5)).await;
    // Let the supervisor settle into the delay
    sleep(Duration::from_millis(100)).await;
    assert_eq!(source.state(), SupervisorState::Running);

    let started = Instant::now();
    source.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(source.state(), SupervisorState::Stopped);
    assert_eq!(recorder.count(), 1);
}

#[tokio::test]
async fn test_stop_terminates_running_command() {
    let config = PipeConfig::new("echo started; sleep 30").with_restart(RestartPolicy::Always);
    let (source, mut rx, recorder) = source(config, 16);

    source.start().await.unwrap();
    assert_eq!(recv(&mut rx).await.message, "started");

    let started = Instant::now();
    source.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(source.state(), SupervisorState::Stopped);
    assert_eq!(recorder.count(), 0);

    // Stopping again changes nothing
    source.stop().await.unwrap();
    assert_eq!(source.state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn test_consecutive_failure_limit() {
    let config = PipeConfig::new("exit 2")
        .with_restart(RestartPolicy::Always)
        .with_restart_delay(Duration::ZERO)
        .with_max_restart_attempts(2);
    let (source, _rx, recorder) = source(config, 16);

    source.start().await.unwrap();
    wait_stopped(&source).await;
    assert_eq!(recorder.count(), 3);
}

#[tokio::test]
async fn test_back_pressure_keeps_every_line() {
    let config = PipeConfig::new("i=0; while [ $i -lt 50 ]; do echo $i; i=$((i+1)); done")
        .with_restart(RestartPolicy::Never);
    let (source, mut rx, recorder) = source(config, 1);

    source.start().await.unwrap();
    sleep(Duration::from_millis(200)).await;

    for i in 0..50 {
        assert_eq!(recv(&mut rx).await.message, i.to_string());
    }
    wait_stopped(&source).await;
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn test_stderr_is_not_delivered() {
    let config = PipeConfig::new("echo out; echo err >&2").with_restart(RestartPolicy::Never);
    let (source, mut rx, _) = source(config, 16);

    source.start().await.unwrap();
    assert_eq!(recv(&mut rx).await.message, "out");
    wait_stopped(&source).await;
    assert_quiet(&mut rx, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_closed_consumer_is_a_read_failure() {
    let config = PipeConfig::new("echo a; echo b").with_restart(RestartPolicy::Never);
    let (source, rx, recorder) = source(config, 16);
    drop(rx);

    source.start().await.unwrap();
    wait_stopped(&source).await;

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.kind, FailureKind::Read);
}

#[tokio::test]
async fn test_records_carry_added_fields() {
    let config = PipeConfig::new("echo hi")
        .with_restart(RestartPolicy::Never)
        .add_field("type", "pipe");
    let (source, mut rx, _) = source(config, 16);

    source.start().await.unwrap();
    let record = recv(&mut rx).await;
    assert_eq!(record.fields.get("type").map(String::as_str), Some("pipe"));
    assert_eq!(record.to_json()["message"], "hi");
    source.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_with_stalled_consumer() {
    let config = PipeConfig::new("while :; do echo X; done")
        .with_restart(RestartPolicy::Always)
        .with_restart_delay(Duration::ZERO);
    let (source, mut rx, recorder) = source(config, 1);

    source.start().await.unwrap();
    assert_eq!(recv(&mut rx).await.message, "X");

    // Stop taking records so the reader blocks on a full channel
    sleep(Duration::from_millis(200)).await;

    timeout(Duration::from_secs(5), source.stop())
        .await
        .expect("stop hung behind a stalled consumer")
        .unwrap();
    assert_eq!(source.state(), SupervisorState::Stopped);
    assert_eq!(recorder.count(), 0);
    drop(rx);
}

#[tokio::test]
async fn test_stop_racing_first_spawn() {
    for round in 0..6 {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let config = PipeConfig::new(format!("echo $$ > {}; exec sleep 30", pidfile.display()))
            .with_restart(RestartPolicy::Always)
            .with_stop_timeout(Duration::from_secs(10));
        let (source, _rx, recorder) = source(config, 16);

        let started = Instant::now();
        let (start, stop) = match round % 3 {
            0 => tokio::join!(source.start(), source.stop()),
            1 => {
                let (stop, start) = tokio::join!(source.stop(), source.start());
                (start, stop)
            }
            _ => tokio::join!(source.start(), async {
                tokio::task::yield_now().await;
                source.stop().await
            }),
        };
        start.unwrap();
        stop.unwrap();

        assert!(
            started.elapsed() < Duration::from_secs(2),
            "stop waited out the grace period in round {}",
            round
        );
        assert_eq!(source.state(), SupervisorState::Stopped);
        assert_eq!(recorder.count(), 0);

        // Whatever got spawned has been reaped
        let pid = std::fs::read_to_string(&pidfile)
            .ok()
            .and_then(|text| text.trim().parse::<i32>().ok());
        if let Some(pid) = pid {
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
            assert!(!alive, "process {} outlived stop in round {}", pid, round);
        }
    }
}

#[tokio::test]
async fn test_missing_shell_is_a_spawn_failure() {
    let config = PipeConfig::new("echo unreachable")
        .with_shell("/nonexistent/shell")
        .with_restart(RestartPolicy::Never);
    let (source, mut rx, recorder) = source(config, 16);

    source.start().await.unwrap();
    assert!(!source.ready());
    wait_stopped(&source).await;

    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.message, FAILURE_MESSAGE);
    assert_eq!(events[0].1.kind, FailureKind::Spawn);
    assert_eq!(events[0].1.command, "echo unreachable");
    assert_quiet(&mut rx, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_missing_shell_retries_under_on_error() {
    let config = PipeConfig::new("echo unreachable")
        .with_shell("/nonexistent/shell")
        .with_restart(RestartPolicy::OnError)
        .with_restart_delay(Duration::from_millis(50));
    let (source, _rx, recorder) = source(config, 16);

    source.start().await.unwrap();
    recorder.wait_for(3, Duration::from_secs(5)).await;
    assert_eq!(source.state(), SupervisorState::Running);

    source.stop().await.unwrap();
    assert!(!source.ready());
    assert!(recorder.events().iter().all(|(_, event)| event.kind == FailureKind::Spawn));
}

#[tokio::test]
async fn test_command_environment_and_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipeConfig::new("echo \"$PIPE_GREETING\"; pwd")
        .with_env("PIPE_GREETING", "hello ☹")
        .with_working_dir(dir.path())
        .with_restart(RestartPolicy::Never);
    let (source, mut rx, recorder) = source(config, 16);

    source.start().await.unwrap();
    assert_eq!(recv(&mut rx).await.message, "hello ☹");
    let pwd = recv(&mut rx).await.message;
    assert!(pwd.ends_with(dir.path().file_name().unwrap().to_str().unwrap()));

    wait_stopped(&source).await;
    assert_eq!(recorder.count(), 0);
}
