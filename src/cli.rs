use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

/// Keep running containers on the newest image of their tag.
#[derive(Parser, Debug, Clone)]
#[command(
    version,
    about,
    long_about = None,
    after_help = "EXAMPLE: freshen -d tcp://1.2.3.4:5678 -i 20 -m container1 container2 -l warn"
)]
pub struct Args {
    /// Docker endpoints to manage.
    #[arg(
        short = 'd',
        long,
        env = "DOCKER_SOCKETS",
        num_args = 1..,
        value_delimiter = ' ',
        default_value = "unix:///var/run/docker.sock"
    )]
    pub docker_sockets: Vec<String>,

    /// Enable Docker TLS. Requires the client certificates in --docker-cert-path.
    #[arg(short = 't', long, env = "DOCKER_TLS")]
    pub docker_tls: bool,

    /// Verify the CA certificate mounted for TLS.
    #[arg(short = 'T', long, env = "DOCKER_TLS_VERIFY", default_value_t = true, action = ArgAction::Set)]
    pub docker_tls_verify: bool,

    /// Directory holding ca.pem, cert.pem and key.pem.
    #[arg(long, env = "DOCKER_CERT_PATH", default_value = "/etc/docker/certs.d")]
    pub docker_cert_path: PathBuf,

    /// Docker client timeout, in seconds.
    #[arg(long, env = "DOCKER_TIMEOUT", default_value_t = 60)]
    pub docker_timeout: u64,

    /// Seconds between update checks.
    #[arg(short = 'i', long, env = "INTERVAL", default_value_t = 300)]
    pub interval: u64,

    /// Five field cron expression used instead of --interval, e.g. "*/5 * * * *".
    #[arg(short = 'C', long, env = "CRON")]
    pub cron: Option<String>,

    /// Seconds a late job may still run. -1 always runs late jobs, 0 never does.
    #[arg(short = 'G', long, env = "GRACE", default_value_t = 15, allow_hyphen_values = true)]
    pub grace: i64,

    #[arg(short = 'l', long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Let freshen update its own container.
    #[arg(short = 'u', long, env = "SELF_UPDATE")]
    pub self_update: bool,

    /// Container name freshen runs under.
    #[arg(long, env = "SELF_NAME", default_value = "freshen")]
    pub self_name: String,

    /// Container id of this process; docker sets HOSTNAME to it.
    #[arg(long, env = "HOSTNAME", hide = true)]
    pub self_id: Option<String>,

    /// Run a single pass and exit.
    #[arg(short = 'o', long, env = "RUN_ONCE")]
    pub run_once: bool,

    /// Detect and log updates without changing anything.
    #[arg(short = 'A', long, env = "DRY_RUN")]
    pub dry_run: bool,

    /// Detect updates and notify without changing anything.
    #[arg(long, env = "MONITOR_ONLY")]
    pub monitor_only: bool,

    /// Notification webhook URLs.
    #[arg(short = 'N', long, env = "NOTIFIERS", num_args = 1.., value_delimiter = ' ')]
    pub notifiers: Vec<String>,

    /// Timezone for cron and notifications: a zone name like Europe/Berlin, local or an offset like +02:00.
    #[arg(long = "timezone", env = "TZ", default_value = "UTC")]
    pub timezone: String,

    /// Update swarm services instead of containers.
    #[arg(short = 'S', long, env = "SWARM")]
    pub swarm: bool,

    /// Containers to monitor. Default: all.
    #[arg(short = 'm', long, env = "MONITOR", num_args = 1.., value_delimiter = ' ')]
    pub monitor: Vec<String>,

    /// Containers to ignore.
    #[arg(short = 'n', long, env = "IGNORE", num_args = 1.., value_delimiter = ' ')]
    pub ignore: Vec<String>,

    /// Honour the com.freshen.enable label. Labels take precedence over names.
    #[arg(short = 'k', long, env = "LABEL_ENABLE")]
    pub label_enable: bool,

    /// Only watch containers that carry the enable label.
    #[arg(short = 'M', long, env = "LABELS_ONLY")]
    pub labels_only: bool,

    /// Remove superseded images after updating.
    #[arg(short = 'c', long, env = "CLEANUP")]
    pub cleanup: bool,

    /// Always update to the :latest tag regardless of the current tag.
    #[arg(short = 'L', long, env = "LATEST_ONLY")]
    pub latest_only: bool,

    /// Private registry username.
    #[arg(short = 'r', long, env = "REPO_USER")]
    pub repo_user: Option<String>,

    /// Private registry password.
    #[arg(short = 'R', long, env = "REPO_PASS")]
    pub repo_pass: Option<String>,

    /// Keep total-updated counters across self updates.
    #[arg(long, env = "SAVE_COUNTERS")]
    pub save_counters: bool,

    /// Where counters are saved.
    #[arg(long, env = "COUNTERS_PATH", default_value = "freshen-counters.json")]
    pub counters_path: PathBuf,

    #[arg(short = 'D', long, env = "DATA_EXPORT", value_enum)]
    pub data_export: Option<DataExportKind>,

    #[arg(short = 'a', long, env = "PROMETHEUS_ADDR", default_value = "127.0.0.1")]
    pub prometheus_addr: String,

    #[arg(short = 'p', long, env = "PROMETHEUS_PORT", default_value_t = 8000)]
    pub prometheus_port: u16,

    #[arg(short = 'I', long, env = "INFLUX_URL", default_value = "127.0.0.1")]
    pub influx_url: String,

    #[arg(short = 'P', long, env = "INFLUX_PORT", default_value_t = 8086)]
    pub influx_port: u16,

    #[arg(short = 'U', long, env = "INFLUX_USERNAME", default_value = "root")]
    pub influx_username: String,

    #[arg(short = 'x', long, env = "INFLUX_PASSWORD", default_value = "root")]
    pub influx_password: String,

    /// Required when exporting to influxdb.
    #[arg(short = 'X', long, env = "INFLUX_DATABASE")]
    pub influx_database: Option<String>,

    #[arg(short = 's', long, env = "INFLUX_SSL")]
    pub influx_ssl: bool,

    #[arg(long, env = "INFLUX_VERIFY_SSL")]
    pub influx_verify_ssl: bool,

    /// Do not notify on startup.
    #[arg(long, env = "SKIP_STARTUP_NOTIFICATIONS")]
    pub skip_startup_notifications: bool,

    /// Update one container or service at a time.
    #[arg(long, env = "SINGLE")]
    pub single: bool,

    /// Seconds to wait between updates when --single is set.
    #[arg(long, env = "SINGLE_WAIT", default_value_t = 0)]
    pub single_wait: u64,

    /// Host name shown in notifications.
    #[arg(long = "hostname", env = "FRESHEN_HOSTNAME", default_value = "freshen")]
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error | LogLevel::Critical => log::LevelFilter::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DataExportKind {
    Prometheus,
    Influxdb,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["freshen"]).unwrap();
        assert_eq!(args.docker_sockets, vec!["unix:///var/run/docker.sock"]);
        assert_eq!(args.interval, 300);
        assert_eq!(args.grace, 15);
        assert!(args.docker_tls_verify);
        assert!(!args.run_once);
        assert_eq!(args.data_export, None);
    }

    #[test]
    fn test_lists_and_negative_grace() {
        let args = Args::try_parse_from([
            "freshen",
            "-d",
            "unix:///var/run/docker.sock",
            "tcp://10.0.0.2:2376",
            "-m",
            "web",
            "db",
            "--grace",
            "-1",
            "-D",
            "influxdb",
        ])
        .unwrap();
        assert_eq!(args.docker_sockets.len(), 2);
        assert_eq!(args.monitor, vec!["web", "db"]);
        assert_eq!(args.grace, -1);
        assert_eq!(args.data_export, Some(DataExportKind::Influxdb));
    }
}
