//! `vtsessiond`: thin daemon entry point.
//!
//! Parses only what the core needs to boot, builds a [`Config`], and
//! constructs the [`SessionManager`] and [`BufferManager`] singletons.
//! Everything past that — HTTP routing, the WebSocket upgrade handshake —
//! is left to whatever embeds this crate; this binary exists to prove the
//! core boots and shuts down cleanly on its own.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use vtsession::buffer::manager::BufferManager;
use vtsession::{Config, SessionManager};

#[derive(Parser)]
#[command(name = "vtsessiond")]
#[command(about = "Terminal multiplexer daemon: PTY session runtime and recording core")]
struct Cli {
    /// Root directory under which every session gets its own subdirectory.
    #[arg(long)]
    control_root: Option<PathBuf>,

    /// Host:port placeholder, passed through to whatever outer router the
    /// embedder wires up; this binary does not itself bind an HTTP server.
    #[arg(long, default_value = "127.0.0.1:7880")]
    bind: String,

    /// `env_logger` filter string, e.g. "info" or "vtsession=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level.clone())).init();

    let mut config = Config::load()?;
    if let Some(control_root) = cli.control_root {
        config.control_root = control_root;
    }

    log::info!(
        "[main] vtsessiond starting, control_root={:?}, bind={}",
        config.control_root,
        cli.bind
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config, shutdown))
}

async fn run(config: Config, shutdown: Arc<AtomicBool>) -> Result<()> {
    let control_root = config.control_root.clone();
    let session_manager = Arc::new(SessionManager::new(config));
    let buffer_manager = Arc::new(BufferManager::new(control_root));

    log::info!("[main] session manager and buffer manager ready");

    while !shutdown.load(Ordering::SeqCst) {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    log::info!("[main] received shutdown signal");

    log::info!("[main] shutting down running sessions");
    session_manager.shutdown_all().await;
    drop(buffer_manager);

    Ok(())
}
