#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hearth_agent::{
    AgentConfig, AgentEvent, LaunchSpec, MemoryPlayerStore, PlayerStore, Supervisor,
    SupervisorError,
};
use hearth_process::{InstanceId, RunState};
use tokio::sync::broadcast;

fn test_config(data_dir: PathBuf) -> AgentConfig {
    AgentConfig {
        data_dir,
        sample_interval: Duration::from_millis(100),
        stop_grace: Duration::from_millis(800),
        kill_settle: Duration::from_secs(5),
        log_max_lines: 1000,
    }
}

fn sh(script: &str) -> LaunchSpec {
    LaunchSpec {
        executable: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
        work_dir: PathBuf::from("/"),
        env: BTreeMap::new(),
    }
}

fn instance(id: &str) -> InstanceId {
    InstanceId(id.to_string())
}

async fn wait_for(
    rx: &mut broadcast::Receiver<AgentEvent>,
    pred: impl Fn(&AgentEvent) -> bool,
) -> AgentEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(ev) if pred(&ev) => return ev,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_stopped_status(ev: &AgentEvent) -> bool {
    matches!(ev, AgentEvent::Status(s) if s.state == RunState::Stopped)
}

fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test]
async fn second_start_is_rejected_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        test_config(dir.path().to_path_buf()),
        Arc::new(MemoryPlayerStore::new()),
    );

    let status = supervisor
        .start(instance("one"), sh("sleep 30"))
        .await
        .unwrap();
    assert!(status.is_running());
    assert_eq!(status.instance_id, Some(instance("one")));

    let err = supervisor
        .start(instance("two"), sh("sleep 30"))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning));

    // The loser must not have overwritten the active session.
    assert_eq!(
        supervisor.status().await.instance_id,
        Some(instance("one"))
    );

    let status = supervisor.stop().await;
    assert_eq!(status.state, RunState::Stopped);
    assert!(status.instance_id.is_none());
}

#[tokio::test]
async fn concurrent_starts_admit_exactly_one() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        test_config(dir.path().to_path_buf()),
        Arc::new(MemoryPlayerStore::new()),
    );

    let (a, b) = tokio::join!(
        supervisor.start(instance("a"), sh("sleep 30")),
        supervisor.start(instance("b"), sh("sleep 30")),
    );
    assert!(
        a.is_ok() ^ b.is_ok(),
        "exactly one start must win: {a:?} / {b:?}"
    );

    let winner = if a.is_ok() { "a" } else { "b" };
    assert_eq!(
        supervisor.status().await.instance_id,
        Some(instance(winner))
    );
    supervisor.stop().await;
}

#[tokio::test]
async fn start_is_accepted_again_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        test_config(dir.path().to_path_buf()),
        Arc::new(MemoryPlayerStore::new()),
    );

    supervisor.start(instance("one"), sh("sleep 30")).await.unwrap();
    supervisor.stop().await;

    let status = supervisor.start(instance("two"), sh("sleep 30")).await.unwrap();
    assert_eq!(status.instance_id, Some(instance("two")));
    supervisor.stop().await;
}

#[tokio::test]
async fn start_with_missing_executable_fails_without_session() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        test_config(dir.path().to_path_buf()),
        Arc::new(MemoryPlayerStore::new()),
    );

    let err = supervisor
        .start(instance("one"), LaunchSpec {
            executable: PathBuf::from("/no/such/binary"),
            args: vec![],
            work_dir: PathBuf::from("/"),
            env: BTreeMap::new(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Spawn(_)));
    assert_eq!(supervisor.status().await.state, RunState::Stopped);
}

#[tokio::test]
async fn self_exit_publishes_exactly_one_stopped_transition() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        test_config(dir.path().to_path_buf()),
        Arc::new(MemoryPlayerStore::new()),
    );
    let mut rx = supervisor.subscribe();

    supervisor
        .start(instance("one"), sh("echo hello"))
        .await
        .unwrap();

    wait_for(&mut rx, |ev| {
        matches!(ev, AgentEvent::Log(l) if l.line == "hello")
    })
    .await;
    wait_for(&mut rx, is_stopped_status).await;

    assert_eq!(supervisor.status().await.state, RunState::Stopped);

    // Settle, then verify no second Stopped transition arrives.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let extra = drain(&mut rx);
    assert!(
        !extra.iter().any(is_stopped_status),
        "unexpected duplicate stopped event: {extra:?}"
    );
}

#[tokio::test]
async fn stop_when_stopped_is_a_silent_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        test_config(dir.path().to_path_buf()),
        Arc::new(MemoryPlayerStore::new()),
    );
    let mut rx = supervisor.subscribe();

    let status = supervisor.stop().await;
    assert_eq!(status.state, RunState::Stopped);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(drain(&mut rx).is_empty(), "no events expected");
}

#[tokio::test]
async fn concurrent_stops_coalesce_into_one_kill_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        test_config(dir.path().to_path_buf()),
        Arc::new(MemoryPlayerStore::new()),
    );
    let mut rx = supervisor.subscribe();

    // Ignores SIGTERM, so only the SIGKILL escalation can end it.
    supervisor
        .start(
            instance("stubborn"),
            sh("trap '' TERM; while true; do sleep 1; done"),
        )
        .await
        .unwrap();

    let (a, b) = tokio::join!(supervisor.stop(), supervisor.stop());
    assert_eq!(a.state, RunState::Stopped);
    assert_eq!(b.state, RunState::Stopped);

    wait_for(&mut rx, is_stopped_status).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stopped_events = drain(&mut rx)
        .iter()
        .filter(|ev| is_stopped_status(ev))
        .count();
    assert_eq!(stopped_events, 0, "only one stopped transition expected");
}

#[tokio::test]
async fn send_line_reaches_child_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        test_config(dir.path().to_path_buf()),
        Arc::new(MemoryPlayerStore::new()),
    );
    let mut rx = supervisor.subscribe();

    supervisor
        .start(instance("echoer"), sh("read x; echo \"got $x\""))
        .await
        .unwrap();

    assert!(supervisor.send_line("ping").await);

    wait_for(&mut rx, |ev| {
        matches!(ev, AgentEvent::Log(l) if l.line == "got ping")
    })
    .await;
    wait_for(&mut rx, is_stopped_status).await;
}

#[tokio::test]
async fn send_line_when_stopped_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Supervisor::new(
        test_config(dir.path().to_path_buf()),
        Arc::new(MemoryPlayerStore::new()),
    );
    assert!(!supervisor.send_line("hello").await);
}

#[tokio::test]
async fn presence_roster_follows_log_lines_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryPlayerStore::new());
    let supervisor = Supervisor::new(test_config(dir.path().to_path_buf()), store.clone());
    let mut rx = supervisor.subscribe();

    let script = concat!(
        "echo '[Server Notification] Client 1 uid ABC123 attempting identification. Name: Bob'; ",
        "echo '[Server Event] Bob [::ffff:10.0.0.5]:4000 joins.'; ",
        "sleep 30",
    );
    supervisor.start(instance("world"), sh(script)).await.unwrap();

    let ev = wait_for(&mut rx, |ev| {
        matches!(ev, AgentEvent::PlayersChanged { players } if !players.is_empty())
    })
    .await;
    match ev {
        AgentEvent::PlayersChanged { players } => {
            assert_eq!(players.len(), 1);
            assert_eq!(players[0].name, "Bob");
            assert_eq!(players[0].uid.as_deref(), Some("ABC123"));
            assert_eq!(players[0].ip.as_deref(), Some("10.0.0.5"));
            assert!(players[0].online);
        }
        _ => unreachable!(),
    }

    // No leave line is coming: the bulk offline path must cover the stop.
    supervisor.stop().await;
    wait_for(&mut rx, |ev| {
        matches!(ev, AgentEvent::PlayersChanged { players }
            if players.iter().all(|p| !p.online) && !players.is_empty())
    })
    .await;

    let players = store.list_players().await.unwrap();
    assert_eq!(players.len(), 1);
    assert!(!players[0].online);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn stats_are_emitted_only_while_running() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("world.dat"), vec![0u8; 64]).unwrap();
    let supervisor = Supervisor::new(
        test_config(dir.path().to_path_buf()),
        Arc::new(MemoryPlayerStore::new()),
    );
    let mut rx = supervisor.subscribe();

    supervisor.start(instance("one"), sh("sleep 30")).await.unwrap();

    let ev = wait_for(&mut rx, |ev| matches!(ev, AgentEvent::Stats(_))).await;
    match ev {
        AgentEvent::Stats(sample) => {
            assert!(sample.timestamp_unix_ms > 0);
            assert_eq!(sample.data_dir_bytes, 64);
        }
        _ => unreachable!(),
    }

    supervisor.stop().await;
    wait_for(&mut rx, is_stopped_status).await;

    // A few intervals of silence: no PID metrics after the exit.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let extra = drain(&mut rx);
    assert!(
        !extra.iter().any(|ev| matches!(ev, AgentEvent::Stats(_))),
        "stats after stop: {extra:?}"
    );
}
