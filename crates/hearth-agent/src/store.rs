use std::collections::HashMap;

use chrono::Utc;
use hearth_process::PlayerEntry;
use tokio::sync::Mutex;

/// Persistence boundary for the player roster. The panel's database layer
/// implements this; the supervisor core only calls it.
#[async_trait::async_trait]
pub trait PlayerStore: Send + Sync {
    async fn upsert_player(
        &self,
        name: &str,
        uid: Option<&str>,
        ip: &str,
        online: bool,
    ) -> anyhow::Result<()>;

    async fn set_player_offline(&self, name: &str) -> anyhow::Result<()>;

    async fn set_all_players_offline(&self) -> anyhow::Result<()>;

    async fn list_players(&self) -> anyhow::Result<Vec<PlayerEntry>>;
}

/// In-memory roster keyed by player name. Backs the standalone binary and
/// tests; a real deployment substitutes the panel database.
#[derive(Debug, Default)]
pub struct MemoryPlayerStore {
    players: Mutex<HashMap<String, PlayerEntry>>,
}

impl MemoryPlayerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PlayerStore for MemoryPlayerStore {
    async fn upsert_player(
        &self,
        name: &str,
        uid: Option<&str>,
        ip: &str,
        online: bool,
    ) -> anyhow::Result<()> {
        let mut players = self.players.lock().await;
        let entry = players
            .entry(name.to_string())
            .or_insert_with(|| PlayerEntry {
                name: name.to_string(),
                uid: None,
                ip: None,
                last_seen: Utc::now(),
                online: false,
            });
        if let Some(uid) = uid {
            entry.uid = Some(uid.to_string());
        }
        entry.ip = Some(ip.to_string());
        entry.last_seen = Utc::now();
        entry.online = online;
        Ok(())
    }

    async fn set_player_offline(&self, name: &str) -> anyhow::Result<()> {
        let mut players = self.players.lock().await;
        if let Some(entry) = players.get_mut(name) {
            entry.online = false;
            entry.last_seen = Utc::now();
        }
        Ok(())
    }

    async fn set_all_players_offline(&self) -> anyhow::Result<()> {
        let mut players = self.players.lock().await;
        for entry in players.values_mut() {
            if entry.online {
                entry.online = false;
                entry.last_seen = Utc::now();
            }
        }
        Ok(())
    }

    async fn list_players(&self) -> anyhow::Result<Vec<PlayerEntry>> {
        let players = self.players.lock().await;
        let mut out: Vec<PlayerEntry> = players.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}
