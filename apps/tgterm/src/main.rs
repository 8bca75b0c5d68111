mod commands;
mod config;
mod logging;

use std::{io, process::ExitCode, sync::Arc};

use commands::Command;
use config::TermConfig;
use serde_json::{Value, json};
use sync_runtime::{line_transport, spawn_runtime};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
    process,
    sync::broadcast::error::RecvError,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
enum AppError {
    #[error("failed to start backend `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("backend process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("terminal i/o failed: {0}")]
    Terminal(#[from] io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting tgterm");

    let config = match TermConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "tgterm stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: TermConfig) -> Result<(), AppError> {
    let mut child = process::Command::new(&config.backend_cmd)
        .args(&config.backend_args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| AppError::Spawn {
            command: config.backend_cmd.clone(),
            source,
        })?;
    let backend_in = child.stdin.take().ok_or(AppError::MissingPipe("stdin"))?;
    let backend_out = child.stdout.take().ok_or(AppError::MissingPipe("stdout"))?;
    info!(command = %config.backend_cmd, pid = ?child.id(), "backend started");

    let (sink, source) = line_transport(BufReader::new(backend_out), backend_in);
    let handle = spawn_runtime(config.runtime_config(), sink, source);
    let mut snapshots = handle.watch();
    let mut events = handle.subscribe();
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut out = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = Arc::clone(&snapshots.borrow_and_update());
                write_line(&mut out, json!({ "snapshot": &*snapshot })).await?;
            }
            event = events.recv() => match event {
                Ok(event) => write_line(&mut out, json!({ "event": event })).await?,
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = input.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                match commands::parse(&line) {
                    Ok(None) => {}
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(Command::Intent(intent))) => {
                        let ticket = handle.submit(intent).map_err(io::Error::other)?;
                        write_line(&mut out, json!({ "ticket": ticket })).await?;
                    }
                    Err(err) => write_line(&mut out, json!({ "error": err.to_string() })).await?,
                }
            }
        }
    }

    handle.shutdown();
    if let Err(err) = child.kill().await {
        debug!(error = %err, "backend already exited");
    }
    info!("tgterm stopped");
    Ok(())
}

async fn write_line(out: &mut Stdout, value: Value) -> io::Result<()> {
    let mut line = value.to_string();
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await
}
