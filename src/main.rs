use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio::sync::watch;

use crate::cli::Args;
use crate::config::{Config, DataExport};
use crate::engine::Shared;
use crate::notify::{NotificationEvent, NotificationManager};
use crate::runtime::{DockerRuntime, RuntimeClient};
use crate::scheduler::Scheduler;

mod cli;
mod config;
mod detector;
mod digest;
mod engine;
mod image_ref;
mod metrics;
mod notify;
mod runtime;
mod scheduler;
mod signals;
mod snapshot;

fn init_logging(config: &Config) {
    // RUST_LOG, when set, wins over --log-level.
    env_logger::Builder::new()
        .filter_level(config.log_level)
        .parse_default_env()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::from_args(Args::parse()) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);
    log::info!("Starting freshen {}", env!("CARGO_PKG_VERSION"));

    let (data, prometheus) = match metrics::from_config(&config) {
        Ok(metrics) => metrics,
        Err(err) => {
            log::error!("Unable to set up metrics: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let (Some(sink), Some(DataExport::Prometheus { addr, port })) =
        (prometheus, config.data_export.clone())
    {
        tokio::spawn(async move {
            if let Err(err) = sink.serve(&addr, port).await {
                log::error!("Prometheus exporter stopped: {err}");
            }
        });
    }

    let shared = Shared {
        config: config.clone(),
        data: Arc::new(data),
        notifier: Arc::new(NotificationManager::from_config(&config)),
    };

    let mut scheduler = Scheduler::new(config.clone());
    let mut reachable = Vec::new();
    for endpoint in &config.endpoints {
        let runtime: Arc<dyn RuntimeClient> = match DockerRuntime::connect(endpoint, &config) {
            Ok(runtime) => Arc::new(runtime),
            Err(err) => {
                log::error!("Unable to create a client for {endpoint}: {err}");
                continue;
            }
        };
        match scheduler.register_endpoint(runtime, &shared).await {
            Ok(()) => reachable.push(endpoint.clone()),
            Err(err) => log::error!("{err}. No jobs scheduled for it"),
        }
    }

    if reachable.is_empty() {
        log::error!("None of the configured endpoints is reachable");
        return ExitCode::FAILURE;
    }

    if !config.skip_startup_notifications {
        shared
            .notifier
            .dispatch(NotificationEvent::Startup {
                endpoints: reachable,
                next_run: scheduler.next_run(Utc::now()),
            })
            .await;
    }

    log::info!("{} jobs scheduled", scheduler.jobs().len());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(err) = signals::handle_shutdown(shutdown_tx) {
        log::error!("Unable to install signal handlers: {err}");
        return ExitCode::FAILURE;
    }
    signals::notify_ready();

    scheduler.run(shutdown_rx).await;
    log::info!("freshen stopped");
    ExitCode::SUCCESS
}
