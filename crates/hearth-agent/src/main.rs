use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use hearth_agent::{AgentConfig, LaunchSpec, MemoryPlayerStore, PlayerStore, Supervisor};
use hearth_process::InstanceId;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Line-based control loop standing in for the panel's HTTP layer: commands
/// on stdin, agent events as JSON lines on stdout.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = AgentConfig::from_env();
    tracing::info!(data_dir = %config.data_dir.display(), "hearth-agent starting");

    let store: Arc<MemoryPlayerStore> = Arc::new(MemoryPlayerStore::new());
    let supervisor = Supervisor::new(config, store.clone());

    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        println!("{json}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(err) = dispatch(&supervisor, store.as_ref(), line).await {
            eprintln!("error: {err:#}");
        }
        if line == "quit" || line == "exit" {
            break;
        }
    }

    supervisor.stop().await;
    Ok(())
}

async fn dispatch(
    supervisor: &Supervisor,
    store: &dyn PlayerStore,
    line: &str,
) -> anyhow::Result<()> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next().unwrap_or_default();

    match cmd {
        "start" => {
            let instance = parts
                .next()
                .ok_or_else(|| anyhow::anyhow!("usage: start <instance-id> <executable> [args...]"))?;
            let executable = PathBuf::from(
                parts
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("usage: start <instance-id> <executable> [args...]"))?,
            );
            let args: Vec<String> = parts.map(str::to_string).collect();
            let work_dir = executable
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));

            let status = supervisor
                .start(
                    InstanceId(instance.to_string()),
                    LaunchSpec {
                        executable,
                        args,
                        work_dir,
                        env: BTreeMap::new(),
                    },
                )
                .await?;
            eprintln!("started: {}", serde_json::to_string(&status)?);
        }
        "stop" => {
            let status = supervisor.stop().await;
            eprintln!("stopped: {}", serde_json::to_string(&status)?);
        }
        "status" => {
            let status = supervisor.status().await;
            eprintln!("{}", serde_json::to_string(&status)?);
            if let Some(info) = supervisor.session_info().await {
                eprintln!("{}", serde_json::to_string(&info)?);
            }
        }
        "say" => {
            let text = line.strip_prefix("say").unwrap_or_default().trim();
            if !supervisor.send_line(text).await {
                eprintln!("server is not running");
            }
        }
        "players" => {
            let players = store.list_players().await?;
            eprintln!("{}", serde_json::to_string(&players)?);
        }
        "tail" => {
            let cursor: u64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let (lines, next) = supervisor.tail_logs(cursor, 100).await;
            for l in &lines {
                eprintln!("{}", l.line);
            }
            eprintln!("cursor: {next}");
        }
        "quit" | "exit" => {}
        _ => {
            eprintln!("commands: start stop status say players tail quit");
        }
    }
    Ok(())
}
