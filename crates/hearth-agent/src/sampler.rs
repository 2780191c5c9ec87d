use std::path::PathBuf;
use std::time::Duration;

use hearth_process::ResourceSample;
use tokio::sync::watch;

use crate::events::{AgentEvent, EventBroadcaster};

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    use std::sync::OnceLock;
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    use std::sync::OnceLock;
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}

#[cfg(target_os = "linux")]
async fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let stat_path = format!("/proc/{pid}/stat");
    let s = tokio::fs::read_to_string(stat_path).await.ok()?;
    // Field 2 (comm) may contain spaces; skip past its closing paren.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let statm_path = format!("/proc/{pid}/statm");
    let s = tokio::fs::read_to_string(statm_path).await.ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

fn cpu_percent_x100(
    prev_ticks: u64,
    prev_at: tokio::time::Instant,
    ticks: u64,
    now: tokio::time::Instant,
) -> u32 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec() as f64) / dt * 100.0;
    // 1/100 of a percent.
    let x100 = (cpu * 100.0).round();
    if x100.is_finite() {
        x100.clamp(0.0, u32::MAX as f64) as u32
    } else {
        0
    }
}

/// Total bytes under `dir`, recursive. Unreadable entries are skipped. The
/// walk is synchronous, so it runs on the blocking pool.
pub async fn dir_size_bytes(dir: PathBuf) -> u64 {
    tokio::task::spawn_blocking(move || {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum()
    })
    .await
    .unwrap_or(0)
}

fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Sample CPU/RSS for `pid` and the data directory size on a fixed cadence,
/// publishing a stats event per tick. The task ends when the exit watch
/// flips; a failed /proc read is a skipped tick, not an error.
pub fn spawn_sampler(
    pid: u32,
    data_dir: PathBuf,
    interval: Duration,
    mut exit_rx: watch::Receiver<bool>,
    events: EventBroadcaster,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last: Option<(u64, tokio::time::Instant)> = None;

        loop {
            tokio::select! {
                changed = exit_rx.changed() => {
                    if changed.is_err() || *exit_rx.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {
                    let now = tokio::time::Instant::now();
                    let Some(ticks) = read_proc_cpu_ticks(pid).await else {
                        continue;
                    };
                    let rss_bytes = read_proc_rss_bytes(pid).await.unwrap_or(0);
                    let data_dir_bytes = dir_size_bytes(data_dir.clone()).await;

                    let cpu = last
                        .map(|(prev_ticks, prev_at)| {
                            cpu_percent_x100(prev_ticks, prev_at, ticks, now)
                        })
                        .unwrap_or(0);
                    last = Some((ticks, now));

                    // The process may have exited while we were reading.
                    // Consumers must never see PID metrics after Stopped.
                    if *exit_rx.borrow() {
                        break;
                    }
                    events.publish(AgentEvent::Stats(ResourceSample {
                        cpu_percent_x100: cpu,
                        rss_bytes,
                        data_dir_bytes,
                        timestamp_unix_ms: now_unix_ms(),
                    }));
                }
            }
        }
    })
}
