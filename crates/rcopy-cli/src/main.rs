mod config;
mod sources;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rcopy_server::serve;
use rcopy_transfer::{TracingLogger, send_files};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Cli, ClientArgs, Command, ServerArgs};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let default_filter = if cli.verbose.enabled() {
        "rcopy=debug,rcopy_transfer=debug,rcopy_server=debug"
    } else {
        "rcopy=info,rcopy_transfer=info,rcopy_server=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.command {
        Command::On(args) => run_on(args).await,
        Command::To(args) => run_to(args).await,
    }
}

async fn run_on(args: ServerArgs) -> anyhow::Result<ExitCode> {
    let config = args.server_config(Arc::new(TracingLogger))?;
    info!("Output dir is '{}'", args.out_dir.display());

    let listener = TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("cannot listen on {}", args.addr))?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    info!("Press Ctrl-C to stop");

    serve(listener, config, cancel).await;
    Ok(ExitCode::SUCCESS)
}

async fn run_to(args: ClientArgs) -> anyhow::Result<ExitCode> {
    let mut paths = args.files;
    if let Some(list) = &args.files_from {
        paths.extend(sources::read_list(list).await?);
    }
    let items = sources::collect(paths).await;
    if items.is_empty() {
        warn!("No file is sent.");
        return Ok(ExitCode::from(exit_status(0, 0)));
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let report = send_files(&args.addr, &items, Arc::new(TracingLogger), cancel).await?;
    for file in report.files.iter().filter(|f| !f.outcome.is_success()) {
        warn!("'{}' {}", file.name, file.outcome);
    }
    let sent = report.files_ok();
    if sent == 0 {
        warn!("No file is sent.");
    } else {
        info!("{} of {} file(s) sent, {} bytes", sent, items.len(), report.bytes());
    }
    Ok(ExitCode::from(exit_status(sent, items.len())))
}

/// 0 when every file went through, 1 when none did, 2 for a partial run.
fn exit_status(sent: usize, total: usize) -> u8 {
    if total > 0 && sent == total {
        0
    } else if sent == 0 {
        1
    } else {
        2
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Cannot install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_status() {
        assert_eq!(exit_status(3, 3), 0);
        assert_eq!(exit_status(0, 3), 1);
        assert_eq!(exit_status(0, 0), 1);
        assert_eq!(exit_status(1, 3), 2);
    }
}
