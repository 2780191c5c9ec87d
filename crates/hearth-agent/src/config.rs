use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 2000;
const DEFAULT_STOP_GRACE_MS: u64 = 10_000;
const DEFAULT_KILL_SETTLE_MS: u64 = 5000;
const DEFAULT_LOG_MAX_LINES: usize = 1000;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub fn sample_interval() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_SAMPLE_INTERVAL_MS")
            .map(|v| v.clamp(250, 60_000))
            .unwrap_or(DEFAULT_SAMPLE_INTERVAL_MS),
    )
}

pub fn stop_grace() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_STOP_GRACE_MS")
            .map(|v| v.clamp(1000, 10 * 60 * 1000))
            .unwrap_or(DEFAULT_STOP_GRACE_MS),
    )
}

/// Time allowed between SIGKILL and the exit watcher observing the exit.
/// Bounds `stop` even if the kernel is slow to reap.
pub fn kill_settle() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_KILL_SETTLE_MS")
            .map(|v| v.clamp(500, 60_000))
            .unwrap_or(DEFAULT_KILL_SETTLE_MS),
    )
}

pub fn log_max_lines() -> usize {
    env_usize("HEARTH_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(DEFAULT_LOG_MAX_LINES)
}

pub fn data_root() -> PathBuf {
    std::env::var("HEARTH_DATA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("server-data"))
}

/// Settings captured once at supervisor construction. Tests override fields
/// directly instead of going through the environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    pub sample_interval: Duration,
    pub stop_grace: Duration,
    pub kill_settle: Duration,
    pub log_max_lines: usize,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: data_root(),
            sample_interval: sample_interval(),
            stop_grace: stop_grace(),
            kill_settle: kill_settle(),
            log_max_lines: log_max_lines(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_env_vars_read_as_none() {
        assert_eq!(env_u64("HEARTH_TEST_UNSET_VAR"), None);
        assert_eq!(env_usize("HEARTH_TEST_UNSET_VAR"), None);
    }

    #[test]
    fn from_env_yields_usable_config() {
        let cfg = AgentConfig::from_env();
        assert!(cfg.sample_interval >= Duration::from_millis(250));
        assert!(cfg.stop_grace >= Duration::from_millis(1000));
        assert!(cfg.log_max_lines >= 100);
    }
}
