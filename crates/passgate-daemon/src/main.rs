use passgate_core::Config;
use passgate_daemon::{Daemon, LogGTimeSink, LogRing, LogSessionSink, RingLayer};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn load_config(path: &str) -> Result<Config, String> {
    let data = std::fs::read(path).map_err(|e| format!("read {path}: {e}"))?;
    let cfg: Config = serde_json::from_slice(&data).map_err(|e| format!("parse {path}: {e}"))?;
    cfg.validate().map_err(|e| e.to_string())?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());

    let cfg = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("passgate: configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let ring = LogRing::default();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info")
        }))
        .with(tracing_subscriber::fmt::layer())
        .with(RingLayer::new(ring.clone()))
        .init();

    let mut daemon = match Daemon::new(
        Arc::new(cfg),
        Box::new(LogSessionSink),
        Box::new(LogGTimeSink),
    ) {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "bootstrap failed");
            return ExitCode::FAILURE;
        }
    };

    match daemon.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}
