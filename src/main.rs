//! Memory Engine - stdio entry point.
//!
//! Loads configuration, initializes structured logging, wires the engine,
//! and runs the newline-framed stdio request loop until stdin closes.

use memory_engine::config::EngineConfig;
use memory_engine::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load()?;
    init_logging(&config);

    tracing::info!(version = memory_engine::VERSION, "starting memory engine");

    let engine = Engine::start(config).await?;
    engine.serve().await?;

    Ok(())
}

/// `tracing-subscriber` with an `EnvFilter` defaulting to the configured
/// level (`RUST_LOG` still takes precedence). Logs always go to stderr (a
/// log file, if configured) rather than stdout: stdout is the newline-framed
/// response channel, and interleaving log lines into it would corrupt the
/// protocol.
fn init_logging(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);

    match &config.logging.file {
        Some(path) => {
            if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                subscriber.with_writer(std::sync::Mutex::new(file)).init();
                return;
            }
            subscriber.init();
        }
        None => subscriber.init(),
    }
}
