use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

mod actions;
mod config;
mod error;
mod exec;
mod scheduler;
mod session;
mod tmux;
mod tools;

use actions::{ParseError, ToolFailure, ToolReply, ToolRequest};
use config::{Cli, Config};
use error::SessionError;
use scheduler::CleanupScheduler;
use session::{SessionManager, SessionRegistry};
use tmux::{Multiplexer, TmuxClient};
use tools::Tools;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging; stdout is reserved for replies
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Arc::new(Config::from(Cli::parse()));

    let mux: Arc<dyn Multiplexer> = Arc::new(TmuxClient::new(
        config.tmux_bin.clone(),
        config.adapter_timeout,
    ));
    match mux.check_available().await {
        Ok(version) => info!(%version, "terminal multiplexer found"),
        Err(e) => {
            let err = SessionError::from(e);
            error!(error = %err, "terminal multiplexer unavailable");
            anyhow::bail!("{} ({})", err, err.recovery_hint());
        }
    }

    exec::artifacts::ensure_dir(&config.artifact_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.artifact_dir.display()))?;

    let registry = Arc::new(SessionRegistry::new());
    let manager = Arc::new(SessionManager::new(mux, registry, config.clone()));
    let scheduler = Arc::new(CleanupScheduler::new(manager.clone()));
    let tools = Arc::new(Tools::new(manager, scheduler.clone()));

    // Startup sweep for artifacts left by a previous run
    scheduler.sweep_artifacts().await;
    let sweeper = scheduler.spawn();

    // Replies are written by a single task so lines never interleave
    let (tx, mut rx) = mpsc::unbounded_channel::<ToolReply>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(reply) = rx.recv().await {
            let mut line = match serde_json::to_string(&reply) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "failed to serialize reply");
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!(error = %e, "stdout closed");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    info!(
        artifacts = %config.artifact_dir.display(),
        idle_threshold_mins = config.idle_threshold.as_secs() / 60,
        "ready for tool calls on stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let result = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e).context("Failed to read stdin"),
                };
                if line.trim().is_empty() {
                    continue;
                }

                match serde_json::from_str::<ToolRequest>(&line) {
                    Ok(request) => {
                        let tools = tools.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let _ = tx.send(tools.handle(request).await);
                        });
                    }
                    Err(e) => {
                        let failure = ToolFailure::from(&ParseError::Malformed(e));
                        let _ = tx.send(ToolReply::err(serde_json::Value::Null, failure));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break Ok(());
            }
        }
    };

    // In-flight calls finish and flush before the writer exits
    sweeper.abort();
    drop(tx);
    let _ = writer.await;
    result
}
