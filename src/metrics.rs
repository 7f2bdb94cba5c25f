//! Per-endpoint counters and their export to Prometheus or InfluxDB.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};

use crate::config::{Config, DataExport, InfluxConfig};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid counters file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Receives the counters of an endpoint after every pass.
pub trait MetricsSink: Send + Sync {
    fn record(&self, endpoint: &str, monitored: u64, total_updated: u64);
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Counters {
    #[serde(skip)]
    monitored: HashMap<String, u64>,
    total_updated: HashMap<String, u64>,
}

/// Process wide counters, keyed by endpoint.
#[derive(Default)]
pub struct DataManager {
    counters: Mutex<Counters>,
    sink: Option<Arc<dyn MetricsSink>>,
}

impl DataManager {
    pub fn new(sink: Option<Arc<dyn MetricsSink>>) -> Self {
        Self {
            counters: Mutex::default(),
            sink,
        }
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_monitored(&self, endpoint: &str, monitored: usize) {
        self.counters()
            .monitored
            .insert(endpoint.to_string(), monitored as u64);
    }

    pub fn add_updated(&self, endpoint: &str, updated: u64) {
        *self
            .counters()
            .total_updated
            .entry(endpoint.to_string())
            .or_default() += updated;
    }

    pub fn monitored(&self, endpoint: &str) -> u64 {
        self.counters().monitored.get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_updated(&self, endpoint: &str) -> u64 {
        self.counters()
            .total_updated
            .get(endpoint)
            .copied()
            .unwrap_or(0)
    }

    /// Persist the total-updated counters as JSON.
    pub fn save(&self, path: &Path) -> Result<(), MetricsError> {
        let json = serde_json::to_string_pretty(&*self.counters())?;
        std::fs::write(path, json)?;
        log::debug!("Saved counters to {}", path.display());
        Ok(())
    }

    /// Load counters saved by a previous process. A missing file is not an error.
    pub fn load(&self, path: &Path) -> Result<(), MetricsError> {
        let json = match std::fs::read_to_string(path) {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let saved: Counters = serde_json::from_str(&json)?;
        self.counters().total_updated = saved.total_updated;
        log::info!("Loaded counters from {}", path.display());
        Ok(())
    }

    /// Hand the endpoint's counters to the configured sink, if any.
    pub fn export(&self, endpoint: &str) {
        if let Some(sink) = &self.sink {
            sink.record(endpoint, self.monitored(endpoint), self.total_updated(endpoint));
        }
    }
}

/// Gauges scraped from `/metrics`.
pub struct PrometheusSink {
    registry: Arc<Registry>,
    monitored: IntGaugeVec,
    updated: IntGaugeVec,
}

impl PrometheusSink {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let monitored = IntGaugeVec::new(
            Opts::new(
                "containers_being_monitored",
                "Count of containers being monitored",
            ),
            &["socket"],
        )?;
        registry.register(Box::new(monitored.clone()))?;

        let updated = IntGaugeVec::new(
            Opts::new("containers_updated", "Count of containers updated"),
            &["socket"],
        )?;
        registry.register(Box::new(updated.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            monitored,
            updated,
        })
    }

    /// Render the registry in Prometheus text format.
    pub fn gather(&self) -> Result<String, MetricsError> {
        export_metrics(&self.registry)
    }

    pub fn router(self: &Arc<Self>) -> axum::Router {
        use axum::routing::get;

        axum::Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(self.clone())
    }

    /// Serve `/metrics` until the process exits.
    pub async fn serve(self: Arc<Self>, addr: &str, port: u16) -> Result<(), MetricsError> {
        let listener = tokio::net::TcpListener::bind((addr, port)).await?;
        log::info!("Serving Prometheus metrics on {addr}:{port}/metrics");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

impl MetricsSink for PrometheusSink {
    fn record(&self, endpoint: &str, monitored: u64, total_updated: u64) {
        self.monitored
            .with_label_values(&[endpoint])
            .set(monitored as i64);
        self.updated
            .with_label_values(&[endpoint])
            .set(total_updated as i64);
    }
}

fn export_metrics(registry: &Registry) -> Result<String, MetricsError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

async fn metrics_handler(State(sink): State<Arc<PrometheusSink>>) -> Response {
    match sink.gather() {
        Ok(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            metrics,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Escape a tag value for the InfluxDB line protocol.
fn escape_tag(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ',' | '=' | ' ') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

pub fn line_protocol(endpoint: &str, monitored: u64, total_updated: u64) -> String {
    format!(
        "freshen,socket={} containers_being_monitored={monitored}i,containers_updated={total_updated}i",
        escape_tag(endpoint)
    )
}

/// Pushes counters to an InfluxDB `/write` endpoint.
pub struct InfluxSink {
    client: reqwest::Client,
    write_url: String,
    config: InfluxConfig,
}

impl InfluxSink {
    pub fn new(config: &InfluxConfig) -> Result<Self, MetricsError> {
        let scheme = if config.ssl { "https" } else { "http" };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .danger_accept_invalid_certs(config.ssl && !config.verify_ssl)
            .build()?;
        Ok(Self {
            client,
            write_url: format!("{scheme}://{}:{}/write", config.url, config.port),
            config: config.clone(),
        })
    }

    async fn write(
        client: reqwest::Client,
        url: String,
        config: InfluxConfig,
        body: String,
    ) -> Result<(), MetricsError> {
        client
            .post(url)
            .query(&[("db", config.database.as_str())])
            .basic_auth(&config.username, Some(&config.password))
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

impl MetricsSink for InfluxSink {
    fn record(&self, endpoint: &str, monitored: u64, total_updated: u64) {
        let body = line_protocol(endpoint, monitored, total_updated);
        let client = self.client.clone();
        let url = self.write_url.clone();
        let config = self.config.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = Self::write(client, url, config, body).await {
                        log::error!("Failed to write metrics to influxdb: {e}");
                    }
                });
            }
            Err(_) => log::warn!("No runtime to write metrics to influxdb"),
        }
    }
}

/// Counters plus the sink `--data-export` asks for. The Prometheus sink is
/// returned separately so its endpoint can be served.
pub fn from_config(config: &Config) -> Result<(DataManager, Option<Arc<PrometheusSink>>), MetricsError> {
    let (sink, prometheus): (Option<Arc<dyn MetricsSink>>, _) = match &config.data_export {
        None => (None, None),
        Some(DataExport::Prometheus { .. }) => {
            let sink = Arc::new(PrometheusSink::new()?);
            (Some(sink.clone()), Some(sink))
        }
        Some(DataExport::Influx(influx)) => (Some(Arc::new(InfluxSink::new(influx)?)), None),
    };

    let data = DataManager::new(sink);
    if config.save_counters {
        data.load(&config.counters_path)?;
    }
    Ok((data, prometheus))
}
