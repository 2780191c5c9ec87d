use chrono::{DateTime, Utc};

/// Opaque identifier correlating a supervised run to a logical server
/// configuration (world/instance). The supervisor carries it through status
/// events but never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Stopped,
    Running,
}

/// Snapshot of the supervisor's lifecycle state. `state` and `instance_id`
/// always change together; consumers never observe one without the other.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    pub instance_id: Option<InstanceId>,
}

impl RunStatus {
    pub fn stopped() -> Self {
        Self {
            state: RunState::Stopped,
            instance_id: None,
        }
    }

    pub fn running(instance_id: InstanceId) -> Self {
        Self {
            state: RunState::Running,
            instance_id: Some(instance_id),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }
}

/// One resource sample for the live server process. Transient: delivered to
/// subscribers, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceSample {
    /// CPU usage in 1/100 of a percent.
    pub cpu_percent_x100: u32,
    pub rss_bytes: u64,
    pub data_dir_bytes: u64,
    pub timestamp_unix_ms: u64,
}

/// One known player as derived from server log output. Keyed by `name`,
/// case-sensitive (the game's own identity key).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlayerEntry {
    pub name: String,
    /// Best-effort: resolved from the most recent identification line seen
    /// for this name, absent if the player joined without one.
    pub uid: Option<String>,
    pub ip: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_non_empty() {
        let id = InstanceId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn stopped_status_has_no_instance() {
        let s = RunStatus::stopped();
        assert_eq!(s.state, RunState::Stopped);
        assert!(s.instance_id.is_none());
        assert!(!s.is_running());
    }

    #[test]
    fn running_status_carries_instance() {
        let id = InstanceId("world-1".to_string());
        let s = RunStatus::running(id.clone());
        assert!(s.is_running());
        assert_eq!(s.instance_id, Some(id));
    }

    #[test]
    fn run_status_serializes_lowercase_state() {
        let s = RunStatus::running(InstanceId("w".to_string()));
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"state\":\"running\""));
        assert!(json.contains("\"instance_id\":\"w\""));
    }
}
