#![forbid(unsafe_code)]

use std::process::ExitCode;

use aura_adapter::{init_tracing, ConnectionHandle, ConnectionRuntime, RuntimeSettings};
use aura_kernel_contracts::ph1duty::DutyChannel;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let settings = RuntimeSettings::from_env()?;
    let budgets = settings.load_budgets()?;
    info!(path = %settings.ux_budgets_path.display(), "budgets loaded");
    let (conn, join) = ConnectionRuntime::spawn(budgets, settings.duty)?;

    let mut events = conn.events();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&json!({ "event": event })) {
                    Ok(line) => println!("{line}"),
                    Err(err) => warn!(%err, "event not serializable"),
                },
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "quit" {
            break;
        }
        let reply = execute(&conn, line).await;
        println!("{}", serde_json::to_string(&reply)?);
    }

    conn.shutdown();
    join.await?;
    drop(conn);
    let _ = printer.await;
    Ok(())
}

// pair | heartbeat | reconnected | reset | active | idle | admit [channel] | status
async fn execute(conn: &ConnectionHandle, line: &str) -> Value {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let result: Result<Value, String> = match command {
        "pair" => conn.pair().await.map(|()| json!("ok")).map_err(|e| e.to_string()),
        "heartbeat" => conn
            .heartbeat()
            .await
            .map(|state| json!(state))
            .map_err(|e| e.to_string()),
        "reconnected" => conn
            .reconnected()
            .await
            .map(|()| json!("ok"))
            .map_err(|e| e.to_string()),
        "reset" => conn.reset().await.map(|()| json!("ok")).map_err(|e| e.to_string()),
        "active" => conn
            .mark_user_active()
            .await
            .map(|()| json!("ok"))
            .map_err(|e| e.to_string()),
        "idle" => conn
            .mark_user_idle()
            .await
            .map(|()| json!("ok"))
            .map_err(|e| e.to_string()),
        "admit" => match parts.next().map(DutyChannel::parse) {
            Some(None) => Err("unknown channel".to_string()),
            Some(Some(channel)) => admit(conn, channel).await,
            None => admit(conn, DutyChannel::Vision).await,
        },
        "status" => conn
            .status()
            .await
            .map(|status| json!(status))
            .map_err(|e| e.to_string()),
        other => Err(format!("unknown command {other:?}")),
    };
    match result {
        Ok(value) => json!({ "command": command, "ok": value }),
        Err(err) => json!({ "command": command, "error": err }),
    }
}

async fn admit(conn: &ConnectionHandle, channel: DutyChannel) -> Result<Value, String> {
    conn.admit(channel)
        .await
        .map(|decision| json!({ "channel": channel, "decision": decision }))
        .map_err(|e| e.to_string())
}
