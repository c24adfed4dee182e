use std::{process, sync::OnceLock};

use lbros::{
    config::Config,
    core::readiness::{Readiness, ReadinessState},
    logger::LoggerManager,
    print_error,
};
use lbros_zmq::{PatternConfig, ZmqClient, ZmqParams};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

static CONFIG: OnceLock<Config> = OnceLock::new();

pub fn config() -> &'static Config {
    CONFIG.get_or_init(|| {
        Config::new().unwrap_or_else(|e| {
            print_error!("{}", e);
            process::exit(1);
        })
    })
}

fn log_patterns_table(patterns: &[PatternConfig], zmq: &ZmqParams) {
    if patterns.is_empty() {
        warn!("No patterns configured, sockets can only be created at runtime");
        return;
    }

    let name_width = patterns
        .iter()
        .map(|p| p.name.len())
        .max()
        .unwrap_or(10)
        .max("Pattern".len());

    info!("{:<width$} | Kind        | Status   | Endpoint", "Pattern", width = name_width);
    info!("{}-+-{}", "-".repeat(name_width), "-".repeat(42));

    for pattern in patterns {
        let endpoint = pattern
            .endpoint
            .clone()
            .unwrap_or_else(|| zmq.default_endpoint(pattern.kind.pattern()));
        let status = if pattern.enabled { "ENABLED" } else { "DISABLED" };
        info!(
            "{:<width$} | {:<11} | {:<8} | {}",
            pattern.name,
            format!("{:?}", pattern.kind),
            status,
            endpoint,
            width = name_width
        );
    }
}

/// Resolves once the client reports a terminal failure.
async fn wait_failed(mut readiness_rx: watch::Receiver<ReadinessState>) -> String {
    loop {
        if let ReadinessState::Failed(reason) = &*readiness_rx.borrow_and_update() {
            return reason.clone();
        }
        if readiness_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = config();
    let mut logger_manager = LoggerManager::new(cfg.logger.clone()).unwrap_or_else(|e| {
        print_error!("Failed to setup Log Manager: {}", e);
        process::exit(1);
    });
    logger_manager.init().unwrap_or_else(|e| {
        print_error!("Failed to init Log Manager: {}", e);
        process::exit(1);
    });
    info!("Starting lbros version {}...", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", cfg.logger.level);
    debug!("{:#?}", cfg.client);

    let client = ZmqClient::new(cfg.client.clone()).unwrap_or_else(|e| {
        error!("Failed to create messaging client: {}", e);
        process::exit(1);
    });
    log_patterns_table(&client.patterns(), &client.params().zmq());

    let readiness = Readiness::default();
    readiness.start_listening(client.state());

    if !client.start().await {
        error!(
            "Messaging client failed to start: {}",
            client.connection_state()
        );
        client.stop().await;
        process::exit(1);
    }
    info!("Status: {}", serde_json::to_string(&client.status())?);

    tokio::select! {
        reason = wait_failed(readiness.subscribe()) => {
            error!("Messaging client failed: {}", reason);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
    }

    let report = client.stop().await;
    info!(
        "Shutdown complete ({} loops joined, {} abandoned)",
        report.joined, report.abandoned
    );
    Ok(())
}
