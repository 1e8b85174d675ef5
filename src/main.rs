use anyhow::{Context, Result};
use std::{env, path::Path, sync::Arc};
use tracing::{info, warn};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, fmt::writer::MakeWriterExt};

use ws_tunnel::{Registry, config, server};

/// Console plus a rolling file under the configured log directory. Falls
/// back to console-only when the directory cannot be created. The guard
/// keeps the non-blocking file writer flushing until process exit.
fn init_logging(log_dir: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match std::fs::create_dir_all(log_dir) {
        Ok(()) => {
            let file_appender = rolling::daily(log_dir, "proxy.log");
            let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_writer.and(std::io::stdout))
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            warn!(log_dir, error = %e, "Could not create log directory; console logging only");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = config::load_config(Path::new("config.toml"))?;
    if let Some(port) = env::args().nth(1) {
        config.listen.port = port
            .parse()
            .with_context(|| format!("Listening port must be a number, got {port}"))?;
    }
    let _guard = init_logging(&config.log_dir);

    info!(
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        default_target = %config.target.to_target_spec(),
        "Configuration loaded"
    );

    let registry = Arc::new(Registry::new());
    let config = Arc::new(config);

    tokio::select! {
        result = server::run(config, registry.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received; shutting down");
            registry.shutdown();
        }
    }

    Ok(())
}
