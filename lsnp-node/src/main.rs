// LSNP peer daemon: UDP broadcast transport, timers, and an interactive command loop.

mod commands;
mod config;
mod net;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use lsnp_core::{LocalProfile, LsnpCore, UserId};
use tokio::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut verbose = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("lsnp {}", VERSION);
                return Ok(());
            }
            "--verbose" | "-v" => verbose = true,
            other => anyhow::bail!("unknown argument {other:?} (usage: lsnp [--verbose] [--version])"),
        }
    }
    init_tracing(verbose);

    let cfg = config::load()?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

/// RUST_LOG wins; otherwise info, or debug with --verbose.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info,lsnp_core=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let transport = net::Transport::bind(cfg.port, cfg.broadcast)
        .with_context(|| format!("binding UDP port {}", cfg.port))?;

    let username = cfg.username();
    let user_id = UserId::new(&username, &net::local_ip().to_string());
    let display_name = cfg.display_name.as_deref().unwrap_or(&username).trim();
    let mut profile = LocalProfile::new(user_id.clone(), display_name);
    profile.status = cfg.status.trim().to_string();

    let history = commands::DmHistory::default();
    let mut core = LsnpCore::new(profile, cfg.protocol.clone());
    commands::register_handlers(&mut core, &history);

    let daemon = net::Daemon {
        core: Arc::new(Mutex::new(core)),
        transport: Arc::new(transport),
        chunk_delay: Duration::from_millis(cfg.chunk_delay_ms),
    };
    info!(user = %user_id, port = cfg.port, broadcast = %cfg.broadcast, "lsnp {} started", VERSION);

    tokio::spawn(net::recv_loop(daemon.clone()));
    let hello = daemon.core.lock().await.announce();
    daemon.execute(hello).await;
    tokio::spawn(net::tick_loop(
        daemon.clone(),
        Duration::from_millis(cfg.tick_ms.max(1)),
    ));
    tokio::spawn(net::keepalive_loop(
        daemon.clone(),
        Duration::from_secs(cfg.keepalive_secs.max(1)),
    ));

    let result = tokio::select! {
        r = commands::command_loop(daemon.clone(), history) => r,
        r = shutdown_signal() => r,
    };

    let goodbye = daemon.core.lock().await.revoke_all_issued();
    daemon.execute(goodbye).await;
    info!("shutting down");
    result
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
