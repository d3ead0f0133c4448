//! quorum daemon — serves the workflow API and runs the kanban auto-engine.

use anyhow::{Context, Result};
use tracing::info;

use qm_core::config::QuorumConfig;

mod daemon;
mod lockfile;

use daemon::Daemon;
use lockfile::DaemonLockfile;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = QuorumConfig::load(".quorum").context("failed to load .quorum/config.yaml")?;
    qm_telemetry::logging::init(&config.general);

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("failed to create {}", data_dir.display()))?;

    // --- Startup guard: one daemon per data dir ---
    let replace_mode = std::env::args().any(|a| a == "--replace" || a == "-r");
    if let Some(existing) = DaemonLockfile::read_valid(&data_dir) {
        if replace_mode {
            info!(pid = existing.pid, "replacing existing daemon (--replace)");
            lockfile::terminate(existing.pid);
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            DaemonLockfile::remove(&data_dir);
        } else {
            eprintln!(
                "quorum daemon already running (pid={}, api={})\n\
                 \n  Hint: use --replace to restart it.",
                existing.pid,
                existing.api_url(),
            );
            std::process::exit(1);
        }
    }

    // --- Bind the API listener ---
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {bind_addr}"))?;
    let local = listener.local_addr()?;
    info!(addr = %local, "API listener bound");

    let lock = DaemonLockfile {
        pid: std::process::id(),
        host: config.server.host.clone(),
        port: local.port(),
        started_at: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Err(msg) = lock.acquire(&data_dir) {
        eprintln!("failed to acquire lockfile: {msg}");
        std::process::exit(1);
    }

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Ctrl-c triggers graceful shutdown and removes the lockfile.
    {
        let data_dir = data_dir.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("ctrl-c received, initiating shutdown");
            DaemonLockfile::remove(&data_dir);
            shutdown.trigger();
        });
    }

    info!("API server: {}", lock.api_url());
    let result = daemon.run_with_listener(listener).await;
    DaemonLockfile::remove(&data_dir);
    result
}
