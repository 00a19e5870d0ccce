//! Gulp Server CLI - runs the message server standalone.
//!
//! Inbound messages are logged; with `--echo` they are also broadcast back
//! to every connected client. See the `gulp_server` library for embedding.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use gulp_server::settings::{HOST_KEY, PORT_KEY};
use gulp_server::{Server, ServerHost, Settings};
use serde_json::Value;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// How often the main thread checks for shutdown.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "gulp-server")]
#[command(version)]
#[command(about = "TCP server exchanging newline-delimited JSON messages")]
struct Cli {
    /// Interface to bind (overrides the settings file)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides the settings file)
    #[arg(long)]
    port: Option<u16>,

    /// Path to settings.json
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Broadcast every received message back to all clients
    #[arg(long)]
    echo: bool,

    /// Start immediately instead of after the configured delay
    #[arg(long)]
    no_delay: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let path = match cli.settings {
        Some(path) => path,
        None => Settings::default_path()?,
    };
    let mut settings = Settings::load(&path)?;
    if let Some(host) = cli.host {
        settings.set(HOST_KEY, Value::from(host));
    }
    if let Some(port) = cli.port {
        settings.set(PORT_KEY, Value::from(port));
    }

    let server = Arc::new(Server::new());
    let registry = Arc::clone(server.registry());
    let echo = cli.echo;
    server.set_handler(move |msg| {
        log::info!("Received: {msg}");
        if echo {
            registry.broadcast(msg);
        }
        Ok(())
    });

    let host = ServerHost::new(server, Arc::new(settings));
    if cli.no_delay {
        if !host.start() {
            anyhow::bail!("Failed to start server on {}", host.configured_addr());
        }
    } else {
        host.on_load();
    }

    while !SHUTDOWN_FLAG.load(Ordering::Relaxed) {
        std::thread::sleep(SHUTDOWN_POLL_INTERVAL);
    }

    log::info!("Shutting down...");
    host.on_unload();
    Ok(())
}
