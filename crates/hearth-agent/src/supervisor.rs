use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use hearth_process::{InstanceId, RunStatus};
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, watch};

use crate::config::AgentConfig;
use crate::console::{LogBuffer, LogSink, spawn_stream_reader};
use crate::events::{AgentEvent, EventBroadcaster, LogLine, LogStream};
use crate::presence::{PresenceInput, spawn_presence_tracker};
use crate::sampler::spawn_sampler;
use crate::store::PlayerStore;

/// Upper bound on one stdin write. The child may stop consuming input; the
/// control surface must not hang behind it.
const STDIN_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the exit watcher waits for the sampler and stream readers to
/// drain after the child dies. A grandchild holding the pipe open must not
/// wedge the supervisor.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("failed to spawn server process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Everything needed to launch one server run.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Snapshot of the active run for the control surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionInfo {
    pub instance_id: InstanceId,
    pub pid: Option<u32>,
    pub executable: PathBuf,
    pub work_dir: PathBuf,
    pub started_at_unix_ms: u64,
}

struct ActiveSession {
    seq: u64,
    instance_id: InstanceId,
    pid: Option<u32>,
    pgid: Option<i32>,
    executable: PathBuf,
    work_dir: PathBuf,
    started_at_unix_ms: u64,
    stdin: Option<ChildStdin>,
    stopping: bool,
    exit_rx: watch::Receiver<bool>,
    sampler: Option<tokio::task::JoinHandle<()>>,
    readers: Vec<tokio::task::JoinHandle<()>>,
}

/// Owns the lifecycle of at most one server process: spawn, stdin writes,
/// termination, and the derived log/stats/status/presence pipelines.
#[derive(Clone)]
pub struct Supervisor {
    config: AgentConfig,
    events: EventBroadcaster,
    session: Arc<Mutex<Option<ActiveSession>>>,
    next_seq: Arc<AtomicU64>,
    logs: Arc<Mutex<LogBuffer>>,
    presence_tx: mpsc::UnboundedSender<PresenceInput>,
}

impl Supervisor {
    pub fn new(config: AgentConfig, store: Arc<dyn PlayerStore>) -> Self {
        let events = EventBroadcaster::new();
        let (presence_tx, presence_rx) = mpsc::unbounded_channel();
        // Process-lifetime task; ends when the last sender is dropped.
        let _presence = spawn_presence_tracker(presence_rx, store, events.clone());

        let logs = Arc::new(Mutex::new(LogBuffer::new(config.log_max_lines)));

        Self {
            config,
            events,
            session: Arc::new(Mutex::new(None)),
            next_seq: Arc::new(AtomicU64::new(1)),
            logs,
            presence_tx,
        }
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Launch the server process. Fails with `AlreadyRunning` while a
    /// session is active; the check and the slot claim happen under one
    /// lock, so concurrent starts cannot both succeed.
    pub async fn start(
        &self,
        instance_id: InstanceId,
        spec: LaunchSpec,
    ) -> Result<RunStatus, SupervisorError> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        if !spec.executable.is_file() {
            return Err(SupervisorError::Spawn(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("server executable not found: {}", spec.executable.display()),
            )));
        }

        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.work_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so the whole process tree can be signalled;
                    // pdeathsig so an agent crash does not orphan the server.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);
        let started_at_unix_ms = now_unix_ms();

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let sink = LogSink::new(
            self.logs.clone(),
            self.events.clone(),
            self.presence_tx.clone(),
        );
        let mut readers = Vec::new();
        if let Some(out) = stdout {
            readers.push(spawn_stream_reader(out, LogStream::Stdout, sink.clone()));
        }
        if let Some(err) = stderr {
            readers.push(spawn_stream_reader(err, LogStream::Stderr, sink.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(false);
        let sampler = pid.map(|p| {
            spawn_sampler(
                p,
                self.config.data_dir.clone(),
                self.config.sample_interval,
                exit_rx.clone(),
                self.events.clone(),
            )
        });

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        *slot = Some(ActiveSession {
            seq,
            instance_id: instance_id.clone(),
            pid,
            pgid,
            executable: spec.executable.clone(),
            work_dir: spec.work_dir.clone(),
            started_at_unix_ms,
            stdin,
            stopping: false,
            exit_rx,
            sampler,
            readers,
        });

        let status = RunStatus::running(instance_id.clone());
        self.events.publish(AgentEvent::Status(status.clone()));
        drop(slot);

        tracing::info!(%instance_id, pid = pid.unwrap_or_default(), exec = %spec.executable.display(), "server started");

        let session = self.session.clone();
        let events = self.events.clone();
        let presence_tx = self.presence_tx.clone();
        let started = tokio::time::Instant::now();
        tokio::spawn(async move {
            let res = child.wait().await;

            // Clear the slot and publish the transition under one lock:
            // a new start cannot be accepted between the two, and the
            // Stopped event can never land after a newer Running event.
            let mut slot = session.lock().await;
            match slot.as_ref() {
                Some(s) if s.seq == seq => {}
                _ => return,
            }
            let s = slot.take().expect("session checked above");

            let _ = exit_tx.send(true);
            if let Some(handle) = s.sampler {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, handle).await;
            }
            for handle in s.readers {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, handle).await;
            }

            let runtime = tokio::time::Instant::now().duration_since(started);
            match res {
                Ok(status) => tracing::info!(
                    exit_code = status.code().unwrap_or_default(),
                    runtime_ms = runtime.as_millis() as u64,
                    "server process exited"
                ),
                Err(err) => tracing::warn!(%err, "wait for server process failed"),
            }

            events.publish(AgentEvent::Status(RunStatus::stopped()));
            let _ = presence_tx.send(PresenceInput::ServerStopped);
            drop(slot);
        });

        Ok(status)
    }

    /// Terminate the active process and wait until it has actually exited.
    /// SIGTERM first; SIGKILL once the grace period elapses. Concurrent
    /// calls coalesce onto the in-flight termination — only the first
    /// caller drives the escalation. No-op when nothing is running.
    pub async fn stop(&self) -> RunStatus {
        let (initiator, pgid, mut exit_rx) = {
            let mut slot = self.session.lock().await;
            let Some(s) = slot.as_mut() else {
                tracing::debug!("stop requested with no active session");
                return RunStatus::stopped();
            };
            let initiator = !s.stopping;
            s.stopping = true;
            if initiator {
                // EOF on stdin doubles as a shutdown hint for the child.
                s.stdin = None;
            }
            (initiator, s.pgid, s.exit_rx.clone())
        };

        if initiator {
            tracing::info!(grace_ms = self.config.stop_grace.as_millis() as u64, "stopping server");
            if let Some(pgid) = pgid {
                signal_group(pgid, Sig::Term);
            }
            if !wait_exited(&mut exit_rx, self.config.stop_grace).await {
                tracing::warn!("grace period elapsed, killing server process group");
                if let Some(pgid) = pgid {
                    signal_group(pgid, Sig::Kill);
                }
                if !wait_exited(&mut exit_rx, self.config.kill_settle).await {
                    tracing::error!("server process did not exit after SIGKILL");
                }
            }
        } else {
            let bound = self.config.stop_grace + self.config.kill_settle + Duration::from_secs(1);
            wait_exited(&mut exit_rx, bound).await;
        }

        self.status().await
    }

    /// Write one line to the server's stdin. Best-effort: returns false
    /// when no session is active or the pipe is gone; a write that cannot
    /// complete within the bound drops the pipe rather than blocking.
    pub async fn send_line(&self, line: &str) -> bool {
        let mut slot = self.session.lock().await;
        let Some(s) = slot.as_mut() else {
            tracing::debug!("send_line with no active session");
            return false;
        };
        let Some(stdin) = s.stdin.as_mut() else {
            tracing::debug!("send_line with stdin already closed");
            return false;
        };

        let mut buf = line.as_bytes().to_vec();
        buf.push(b'\n');

        let result = tokio::time::timeout(STDIN_WRITE_TIMEOUT, async {
            stdin.write_all(&buf).await?;
            stdin.flush().await
        })
        .await;
        match result {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::debug!(%err, "stdin write failed, dropping pipe");
                s.stdin = None;
                false
            }
            Err(_) => {
                tracing::warn!("stdin write timed out, dropping pipe");
                s.stdin = None;
                false
            }
        }
    }

    pub async fn status(&self) -> RunStatus {
        let slot = self.session.lock().await;
        match slot.as_ref() {
            Some(s) => RunStatus::running(s.instance_id.clone()),
            None => RunStatus::stopped(),
        }
    }

    pub async fn session_info(&self) -> Option<SessionInfo> {
        let slot = self.session.lock().await;
        slot.as_ref().map(|s| SessionInfo {
            instance_id: s.instance_id.clone(),
            pid: s.pid,
            executable: s.executable.clone(),
            work_dir: s.work_dir.clone(),
            started_at_unix_ms: s.started_at_unix_ms,
        })
    }

    /// Console scrollback strictly after `cursor`; cursor 0 returns the most
    /// recent lines. The buffer survives across runs.
    pub async fn tail_logs(&self, cursor: u64, limit: usize) -> (Vec<LogLine>, u64) {
        self.logs.lock().await.tail_after(cursor, limit)
    }
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// True once the exit watch observes the exit. A closed channel means the
/// watcher is already done, which also counts as exited.
async fn wait_exited(exit_rx: &mut watch::Receiver<bool>, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, exit_rx.wait_for(|exited| *exited)).await {
        Ok(Ok(_)) => true,
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}

#[derive(Clone, Copy)]
enum Sig {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: i32, sig: Sig) {
    let signo = match sig {
        Sig::Term => libc::SIGTERM,
        Sig::Kill => libc::SIGKILL,
    };
    // Negative pid targets the whole process group.
    unsafe {
        libc::kill(-pgid, signo);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _sig: Sig) {}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // NOTE: `unsafe fn` bodies are not implicitly unsafe in Rust 2024.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}
