use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::sync::mpsc;

use crate::events::{AgentEvent, EventBroadcaster};
use crate::store::PlayerStore;

// Lines the game server prints for the player lifecycle, e.g.:
//   28.11.2025 20:45:37 [Server Notification] Client 1 uid IbI4Fuu3SxGfuSvjIOk3DZ4B attempting identification. Name: Uraka
//   28.11.2025 20:45:41 [Server Event] Uraka [::ffff:149.102.168.245]:57239 joins.
//   28.11.2025 20:47:23 [Server Event] Player Uraka left.
//   28.11.2025 20:47:23 [Server Notification] UDP: client disconnected Uraka
static IDENTIFICATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Client \d+ uid ([^ ]+) attempting identification\. Name: (.+)").unwrap()
});
static JOIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[Server Event\] (.+) \[([^\]]+)\]:\d+ joins\.").unwrap());
static LEAVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[Server Event\] Player (.+) left\.").unwrap());
static DISCONNECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"UDP: client disconnected (.+)").unwrap());

/// What a single console line means for the roster. Log text is externally
/// controlled, so everything that does not parse cleanly is `Unmatched`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    Identification { uid: String, name: String },
    Join { name: String, ip: String },
    Leave { name: String },
    Disconnect { name: String },
    Unmatched,
}

/// Classify one line against the known patterns, first match wins.
pub fn classify(line: &str) -> LineEvent {
    if let Some(caps) = IDENTIFICATION.captures(line) {
        let uid = caps[1].trim();
        let name = caps[2].trim();
        if !uid.is_empty() && !name.is_empty() {
            return LineEvent::Identification {
                uid: uid.to_string(),
                name: name.to_string(),
            };
        }
        return LineEvent::Unmatched;
    }

    if let Some(caps) = JOIN.captures(line) {
        let name = caps[1].trim();
        let ip = normalize_ip(&caps[2]);
        if !name.is_empty() && !ip.is_empty() {
            return LineEvent::Join {
                name: name.to_string(),
                ip,
            };
        }
        return LineEvent::Unmatched;
    }

    if let Some(caps) = LEAVE.captures(line) {
        let name = caps[1].trim();
        if !name.is_empty() {
            return LineEvent::Leave {
                name: name.to_string(),
            };
        }
        return LineEvent::Unmatched;
    }

    if let Some(caps) = DISCONNECT.captures(line) {
        let name = caps[1].trim();
        if !name.is_empty() {
            return LineEvent::Disconnect {
                name: name.to_string(),
            };
        }
        return LineEvent::Unmatched;
    }

    LineEvent::Unmatched
}

/// The game reports IPv4 clients as IPv6-mapped addresses.
fn normalize_ip(raw: &str) -> String {
    raw.trim().trim_start_matches("::ffff:").to_string()
}

/// Input to the presence task. `ServerStopped` travels on the same channel
/// as lines so it is ordered after everything the process printed.
#[derive(Debug)]
pub enum PresenceInput {
    Line(String),
    ServerStopped,
}

/// Consume the console feed and maintain the roster through the store.
///
/// Single consumer: the name→uid cache lives on this task and needs no lock.
/// The cache is process-lifetime with no expiry; a name re-identifying with
/// a different uid overwrites the previous mapping.
pub fn spawn_presence_tracker(
    mut rx: mpsc::UnboundedReceiver<PresenceInput>,
    store: Arc<dyn PlayerStore>,
    events: EventBroadcaster,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut name_to_uid: HashMap<String, String> = HashMap::new();

        while let Some(input) = rx.recv().await {
            match input {
                PresenceInput::Line(line) => match classify(&line) {
                    LineEvent::Identification { uid, name } => {
                        name_to_uid.insert(name, uid);
                    }
                    LineEvent::Join { name, ip } => {
                        let uid = name_to_uid.get(&name).map(String::as_str);
                        if let Err(err) = store.upsert_player(&name, uid, &ip, true).await {
                            tracing::warn!(%name, %err, "player upsert failed");
                            continue;
                        }
                        publish_roster(&store, &events).await;
                    }
                    LineEvent::Leave { name } | LineEvent::Disconnect { name } => {
                        if let Err(err) = store.set_player_offline(&name).await {
                            tracing::warn!(%name, %err, "set offline failed");
                            continue;
                        }
                        publish_roster(&store, &events).await;
                    }
                    LineEvent::Unmatched => {}
                },
                PresenceInput::ServerStopped => {
                    // No leave lines arrive for players connected at
                    // crash/kill time.
                    if let Err(err) = store.set_all_players_offline().await {
                        tracing::warn!(%err, "bulk offline failed");
                        continue;
                    }
                    publish_roster(&store, &events).await;
                }
            }
        }
    })
}

async fn publish_roster(store: &Arc<dyn PlayerStore>, events: &EventBroadcaster) {
    match store.list_players().await {
        Ok(players) => events.publish(AgentEvent::PlayersChanged { players }),
        Err(err) => tracing::warn!(%err, "roster read failed"),
    }
}
