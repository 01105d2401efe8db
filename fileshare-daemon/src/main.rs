// FileShare: LAN file sharing daemon. Run without arguments to receive, `send` to send one file.

use std::sync::Arc;

use anyhow::Context;
use fileshare_core::integrity::to_hex;
use fileshare_daemon::{config, AutoAccept, ConsolePrompt, Service, UserPrompt};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let command = std::env::args().nth(1);
    if matches!(command.as_deref(), Some("--version") | Some("-V")) {
        println!("fileshare {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fileshare=info,fileshare_daemon=info".into()),
        )
        .init();

    let cfg = config::load();
    let prompt: Arc<dyn UserPrompt> = match (&cfg.auto_accept_dir, command.as_deref()) {
        (Some(dir), None) => Arc::new(AutoAccept::new(dir.clone())),
        _ => Arc::new(ConsolePrompt::stdio()),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let service = Service::new(cfg, prompt).context("cannot create service")?;
        match command.as_deref() {
            None => {
                let addr = service.start().await.context("cannot start service")?;
                info!(%addr, version = VERSION, "fileshare running");
                shutdown_signal().await?;
                service.stop().await?;
            }
            Some("send") => {
                let report = service.send_file().await?;
                println!(
                    "sent {} ({} bytes, sha256 {})",
                    report.file_name,
                    report.bytes_sent,
                    to_hex(&report.digest)
                );
            }
            Some(other) => anyhow::bail!("unknown command {other:?}; expected `send` or no argument"),
        }
        Ok(())
    })
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
