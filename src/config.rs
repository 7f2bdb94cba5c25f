use std::{collections::BTreeSet, path::PathBuf, str::FromStr, time::Duration};

use chrono::{DateTime, FixedOffset, Local, TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::cli::{Args, DataExportKind};
use crate::detector::Selection;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },
    #[error("Invalid timezone '{0}', expected a zone name like Europe/Berlin, local or an offset like +02:00")]
    InvalidTimezone(String),
    #[error("Invalid docker endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("Invalid grace '{0}', expected -1 or a number of seconds")]
    InvalidGrace(i64),
    #[error("An influx database name is required when exporting to influxdb")]
    MissingInfluxDatabase,
    #[error("Invalid notifier '{0}'")]
    InvalidNotifier(String),
}

/// When update passes run.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePolicy {
    RunOnce,
    Interval(Duration),
    Cron(Box<Schedule>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Timezone {
    #[default]
    Utc,
    Local,
    Fixed(FixedOffset),
    /// An IANA zone, e.g. `Europe/Berlin`.
    Named(Tz),
}

impl FromStr for Timezone {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "UTC" | "utc" | "Etc/UTC" | "Z" => Ok(Timezone::Utc),
            "local" | "Local" => Ok(Timezone::Local),
            tz => FixedOffset::from_str(tz)
                .map(Timezone::Fixed)
                .or_else(|_| tz.parse::<Tz>().map(Timezone::Named))
                .map_err(|_| ConfigError::InvalidTimezone(s.to_string())),
        }
    }
}

impl Timezone {
    /// Render `at` in this timezone.
    pub fn format(&self, at: DateTime<Utc>, fmt: &str) -> String {
        match self {
            Timezone::Utc => at.format(fmt).to_string(),
            Timezone::Local => at.with_timezone(&Local).format(fmt).to_string(),
            Timezone::Fixed(offset) => at.with_timezone(offset).format(fmt).to_string(),
            Timezone::Named(tz) => at.with_timezone(tz).format(fmt).to_string(),
        }
    }

    /// Next fire time of `schedule` strictly after `after`, evaluated in this timezone.
    pub fn next_cron_fire(&self, schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        fn next_in<Z: TimeZone>(schedule: &Schedule, after: DateTime<Z>) -> Option<DateTime<Utc>> {
            schedule.after(&after).next().map(|d| d.with_timezone(&Utc))
        }
        match self {
            Timezone::Utc => next_in(schedule, after),
            Timezone::Local => next_in(schedule, after.with_timezone(&Local)),
            Timezone::Fixed(offset) => next_in(schedule, after.with_timezone(offset)),
            Timezone::Named(tz) => next_in(schedule, after.with_timezone(tz)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub verify: bool,
}

impl TlsConfig {
    pub fn ca(&self) -> PathBuf {
        self.cert_path.join("ca.pem")
    }
    pub fn cert(&self) -> PathBuf {
        self.cert_path.join("cert.pem")
    }
    pub fn key(&self) -> PathBuf {
        self.cert_path.join("key.pem")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfluxConfig {
    pub url: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub ssl: bool,
    pub verify_ssl: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataExport {
    Prometheus { addr: String, port: u16 },
    Influx(InfluxConfig),
}

/// Immutable runtime configuration, built once from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoints: Vec<String>,
    pub tls: Option<TlsConfig>,
    pub docker_timeout: Duration,
    pub policy: UpdatePolicy,
    /// `None` runs late jobs no matter how late.
    pub grace: Option<Duration>,
    pub timezone: Timezone,
    pub selection: Selection,
    pub cleanup: bool,
    pub latest_only: bool,
    pub swarm: bool,
    pub single: bool,
    pub single_wait: Duration,
    pub dry_run: bool,
    pub monitor_only: bool,
    pub self_update: bool,
    pub self_name: String,
    pub self_id: Option<String>,
    pub credentials: Option<Credentials>,
    pub save_counters: bool,
    pub counters_path: PathBuf,
    pub data_export: Option<DataExport>,
    pub notifiers: Vec<String>,
    pub skip_startup_notifications: bool,
    pub hostname: String,
    pub log_level: log::LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: vec!["unix:///var/run/docker.sock".to_string()],
            tls: None,
            docker_timeout: Duration::from_secs(60),
            policy: UpdatePolicy::Interval(Duration::from_secs(300)),
            grace: Some(Duration::from_secs(15)),
            timezone: Timezone::Utc,
            selection: Selection::default(),
            cleanup: false,
            latest_only: false,
            swarm: false,
            single: false,
            single_wait: Duration::ZERO,
            dry_run: false,
            monitor_only: false,
            self_update: false,
            self_name: "freshen".to_string(),
            self_id: None,
            credentials: None,
            save_counters: false,
            counters_path: PathBuf::from("freshen-counters.json"),
            data_export: None,
            notifiers: Vec::new(),
            skip_startup_notifications: false,
            hostname: "freshen".to_string(),
            log_level: log::LevelFilter::Info,
        }
    }
}

const ENDPOINT_SCHEMES: &[&str] = &["unix://", "tcp://", "http://", "https://"];

fn day_number(value: &str) -> Result<u32, String> {
    value
        .parse::<u32>()
        .ok()
        .filter(|day| *day <= 7)
        .ok_or_else(|| format!("invalid day of week '{value}'"))
}

/// Translate a crontab day-of-week field (0-7, Sunday is 0 and 7) to the
/// `cron` crate's numbering (1-7, Sunday is 1). Named days pass through.
fn translate_weekdays(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (range, step),
                _ => return Err(format!("invalid step in '{item}'")),
            },
            None => (item, 1),
        };
        let (first, last) = if range == "*" {
            (0, 6)
        } else if let Some((first, last)) = range.split_once('-') {
            (day_number(first)?, day_number(last)?)
        } else if step > 1 {
            (day_number(range)?, 6)
        } else {
            let day = day_number(range)?;
            (day, day)
        };
        if first > last {
            return Err(format!("invalid day of week range '{range}'"));
        }
        days.extend((first..=last).step_by(step).map(|day| day % 7));
    }

    Ok(days
        .iter()
        .map(|day| (day + 1).to_string())
        .collect::<Vec<_>>()
        .join(","))
}

/// Parse a five field cron expression into the seconds-first form the
/// `cron` crate expects.
pub fn parse_cron(expr: &str) -> Result<Schedule, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidCron {
        expr: expr.to_string(),
        reason,
    };
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
    }
    let weekdays = translate_weekdays(fields[4]).map_err(invalid)?;
    Schedule::from_str(&format!("0 {} {weekdays}", fields[..4].join(" ")))
        .map_err(|e| invalid(e.to_string()))
}

pub fn parse_grace(grace: i64) -> Result<Option<Duration>, ConfigError> {
    match grace {
        -1 => Ok(None),
        g if g >= 0 => Ok(Some(Duration::from_secs(g as u64))),
        g => Err(ConfigError::InvalidGrace(g)),
    }
}

fn parse_endpoint(endpoint: &str) -> Result<String, ConfigError> {
    let endpoint = endpoint.trim();
    if ENDPOINT_SCHEMES
        .iter()
        .any(|scheme| endpoint.len() > scheme.len() && endpoint.starts_with(scheme))
    {
        Ok(endpoint.to_string())
    } else {
        Err(ConfigError::InvalidEndpoint(endpoint.to_string()))
    }
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let endpoints = args
            .docker_sockets
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(|s| parse_endpoint(s))
            .collect::<Result<Vec<_>, _>>()?;

        let policy = if args.run_once {
            UpdatePolicy::RunOnce
        } else if let Some(expr) = args.cron.as_deref().filter(|c| !c.trim().is_empty()) {
            UpdatePolicy::Cron(Box::new(parse_cron(expr)?))
        } else {
            UpdatePolicy::Interval(Duration::from_secs(args.interval.max(1)))
        };

        let data_export = match args.data_export {
            None => None,
            Some(DataExportKind::Prometheus) => Some(DataExport::Prometheus {
                addr: args.prometheus_addr,
                port: args.prometheus_port,
            }),
            Some(DataExportKind::Influxdb) => Some(DataExport::Influx(InfluxConfig {
                url: args.influx_url,
                port: args.influx_port,
                username: args.influx_username,
                password: args.influx_password,
                database: args
                    .influx_database
                    .ok_or(ConfigError::MissingInfluxDatabase)?,
                ssl: args.influx_ssl,
                verify_ssl: args.influx_verify_ssl,
            })),
        };

        let credentials = match (args.repo_user, args.repo_pass) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            _ => None,
        };

        Ok(Self {
            endpoints,
            tls: args.docker_tls.then(|| TlsConfig {
                cert_path: args.docker_cert_path,
                verify: args.docker_tls_verify,
            }),
            docker_timeout: Duration::from_secs(args.docker_timeout),
            policy,
            grace: parse_grace(args.grace)?,
            timezone: args.timezone.parse()?,
            selection: Selection {
                monitor: args.monitor,
                ignore: args.ignore,
                label_enable: args.label_enable || args.labels_only,
                labels_only: args.labels_only,
            },
            cleanup: args.cleanup,
            latest_only: args.latest_only,
            swarm: args.swarm,
            single: args.single,
            single_wait: Duration::from_secs(args.single_wait),
            dry_run: args.dry_run,
            monitor_only: args.monitor_only,
            self_update: args.self_update,
            self_name: args.self_name,
            self_id: args.self_id.filter(|id| !id.is_empty()),
            credentials,
            save_counters: args.save_counters,
            counters_path: args.counters_path,
            data_export,
            notifiers: args.notifiers,
            skip_startup_notifications: args.skip_startup_notifications,
            hostname: args.hostname,
            log_level: args.log_level.into(),
        })
    }

    /// Detection only: nothing on the endpoint is changed.
    pub fn is_read_only(&self) -> bool {
        self.dry_run || self.monitor_only
    }
}
