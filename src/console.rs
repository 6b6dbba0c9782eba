use crate::messages::{ControlCommand, StatusReport};
use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

pub fn parse_command(line: &str) -> Option<ControlCommand> {
    match line.trim().to_ascii_lowercase().as_str() {
        "start" => Some(ControlCommand::Start),
        "stop" => Some(ControlCommand::Stop),
        "status" => Some(ControlCommand::Status),
        "quit" | "exit" => Some(ControlCommand::Quit),
        _ => None,
    }
}

/// Read operator commands from stdin, one per line
///
/// Returns when stdin closes or the receiving side goes away. Closing stdin
/// does not stop the agent; remote control keeps working.
pub async fn read_commands(tx: mpsc::Sender<ControlCommand>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        match parse_command(&line) {
            Some(cmd) => {
                tracing::debug!("Console command: {:?}", cmd);
                if tx.send(cmd).await.is_err() {
                    break;
                }
            }
            None if line.trim().is_empty() => {}
            None => tracing::warn!(
                "Unknown command {:?} (expected start, stop, status or quit)",
                line.trim()
            ),
        }
    }

    tracing::debug!("Console input closed");
    Ok(())
}

/// Show every status report to the operator
pub async fn show_status(mut rx: broadcast::Receiver<StatusReport>) {
    loop {
        match rx.recv().await {
            Ok(report) => tracing::info!("Status: {}", report),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Status display skipped {} stale reports", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
