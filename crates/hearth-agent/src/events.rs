use hearth_process::{PlayerEntry, ResourceSample, RunStatus};
use tokio::sync::broadcast;

/// Broadcast channel capacity. Subscribers that fall further behind than
/// this lag and drop old events; they never block the producer side.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One line of server console output.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogLine {
    pub stream: LogStream,
    pub line: String,
}

/// Everything the supervisor publishes. The socket broadcaster relays these
/// to browsers verbatim; the presence store consumes `PlayersChanged`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AgentEvent {
    Log(LogLine),
    Status(RunStatus),
    Stats(ResourceSample),
    PlayersChanged { players: Vec<PlayerEntry> },
}

/// Fan-out point for agent events. Owned by the supervisor; external
/// consumers register through `subscribe` rather than a process-wide global,
/// so teardown follows the owner's lifetime.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<AgentEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Best-effort delivery: a send with no subscribers is not an error.
    pub fn publish(&self, event: AgentEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_process::InstanceId;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBroadcaster::new();
        let mut rx = bus.subscribe();
        bus.publish(AgentEvent::Status(RunStatus::running(InstanceId(
            "w".to_string(),
        ))));

        let got = rx.recv().await.unwrap();
        match got {
            AgentEvent::Status(s) => assert!(s.is_running()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBroadcaster::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(AgentEvent::Log(LogLine {
            stream: LogStream::Stdout,
            line: "hello".to_string(),
        }));
    }

    #[test]
    fn status_event_serializes_tagged() {
        let ev = AgentEvent::Status(RunStatus::stopped());
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"status\""));
        assert!(json.contains("\"state\":\"stopped\""));
    }
}
