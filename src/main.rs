use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use pluxy::config::AgentConfig;
use pluxy::envelope::FrameResponse;
use pluxy::plugins::PluginManager;

/// Plugin-dispatch agent bridging envelope messages to HTTP and SQL backends
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Responses go to stdout, so logs stay on stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(AgentConfig::default_path);
    let config = AgentConfig::load(&config_path)?;
    info!(path = %config_path.display(), "configuration loaded");

    let manager = PluginManager::new();
    manager.load_builtin(&config).await;

    // Single writer task keeps concurrently handled responses from
    // interleaving on stdout.
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut reload = signal(SignalKind::hangup())?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        let manager = manager.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let frame = match manager.dispatch(line.as_bytes()).await {
                                Ok(frame) => frame,
                                Err(err) => {
                                    error!(%err, "dispatch failed");
                                    FrameResponse::error(err.to_string())
                                }
                            };
                            match serde_json::to_string(&frame) {
                                Ok(out) => {
                                    let _ = tx.send(out).await;
                                }
                                Err(err) => error!(%err, "response serialization failed"),
                            }
                        });
                    }
                    None => break,
                }
            }
            _ = reload.recv() => {
                info!(path = %config_path.display(), "reloading configuration");
                match AgentConfig::load(&config_path) {
                    Ok(config) => manager.reload_all(&config).await,
                    Err(err) => warn!(%err, "config reload failed, keeping current snapshot"),
                }
            }
        }
    }

    info!("input closed, shutting down");
    manager.close_all().await;
    drop(tx);
    let _ = writer.await;
    Ok(())
}
