use clap::Parser;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    /// UPS device address (host or host:port), reached over https
    #[arg(env = "UPS_AGENT_DEVICE_ADDRESS", long = "device-address", value_name = "addr")]
    pub device_address: String,

    /// Username for the device web interface
    #[arg(env = "UPS_AGENT_USERNAME", long = "username", value_name = "user")]
    pub username: String,

    /// Password for the device web interface
    #[arg(
        env = "UPS_AGENT_PASSWORD",
        long = "password",
        value_name = "pass",
        hide_env_values = true
    )]
    pub password: String,

    /// Poll interval for both loops in milliseconds
    #[arg(
        env = "UPS_AGENT_POLL_INTERVAL_MS",
        long = "poll-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "10000"
    )]
    pub poll_interval: Duration,

    /// Per-request transport timeout in milliseconds
    #[arg(
        env = "UPS_AGENT_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "10000"
    )]
    pub request_timeout: Duration,

    /// Absolute deadline for one device call in milliseconds
    #[arg(
        env = "UPS_AGENT_CALL_DEADLINE_MS",
        long = "call-deadline-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "30000"
    )]
    pub call_deadline: Duration,

    /// Attempt cap for quick retries on transport timeouts
    #[arg(
        env = "UPS_AGENT_QUICK_RETRIES",
        long = "quick-retries",
        value_name = "int",
        default_value = "2"
    )]
    pub quick_retries: u32,

    /// Delay between quick retries in milliseconds
    #[arg(
        env = "UPS_AGENT_QUICK_RETRY_DELAY_MS",
        long = "quick-retry-delay-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "2000"
    )]
    pub quick_retry_delay: Duration,

    /// Page size requested from the notification log
    #[arg(
        env = "UPS_AGENT_NOTIFICATION_PAGE_SIZE",
        long = "notification-page-size",
        value_name = "int",
        default_value = "1000"
    )]
    pub notification_page_size: u32,

    /// Path of the notification cursor state file
    #[arg(
        env = "UPS_AGENT_STATE_FILE",
        long = "state-file",
        value_name = "path",
        default_value = "conf/state.json"
    )]
    pub state_file: PathBuf,

    /// Interval between cursor flushes in milliseconds
    #[arg(
        env = "UPS_AGENT_SAVE_INTERVAL_MS",
        long = "save-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "30000"
    )]
    pub save_interval: Duration,

    /// Grace period for tasks to finish on shutdown, in milliseconds
    #[arg(
        env = "UPS_AGENT_SHUTDOWN_GRACE_MS",
        long = "shutdown-grace-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "5000"
    )]
    pub shutdown_grace: Duration,

    /// InfluxDB endpoint URI
    #[arg(
        env = "UPS_AGENT_INFLUX_URL",
        long = "influx-url",
        value_name = "uri",
        default_value = "http://localhost:8086"
    )]
    pub influx_url: String,

    /// InfluxDB database to write snapshots into
    #[arg(
        env = "UPS_AGENT_INFLUX_DATABASE",
        long = "influx-database",
        value_name = "db",
        default_value = "ups"
    )]
    pub influx_database: String,

    /// VictoriaLogs endpoint URI
    #[arg(
        env = "UPS_AGENT_VICTORIALOGS_URL",
        long = "victorialogs-url",
        value_name = "uri",
        default_value = "http://localhost:9428"
    )]
    pub victorialogs_url: String,

    /// Username for VictoriaLogs basic auth
    #[arg(
        env = "UPS_AGENT_VICTORIALOGS_USERNAME",
        long = "victorialogs-username",
        value_name = "user",
        requires = "victorialogs_password"
    )]
    pub victorialogs_username: Option<String>,

    /// Password for VictoriaLogs basic auth
    #[arg(
        env = "UPS_AGENT_VICTORIALOGS_PASSWORD",
        long = "victorialogs-password",
        value_name = "pass",
        hide_env_values = true,
        requires = "victorialogs_username"
    )]
    pub victorialogs_password: Option<String>,
}

pub fn parse() -> Cli {
    Parser::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_everything_but_device_and_credentials() {
        let cli = Cli::try_parse_from([
            "ups-agent",
            "--device-address",
            "10.0.0.5",
            "--username",
            "admin",
            "--password",
            "secret",
        ])
        .unwrap();

        assert_eq!(cli.poll_interval, Duration::from_secs(10));
        assert_eq!(cli.call_deadline, Duration::from_secs(30));
        assert_eq!(cli.quick_retries, 2);
        assert_eq!(cli.state_file, PathBuf::from("conf/state.json"));
        assert_eq!(cli.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn victorialogs_credentials_must_come_in_pairs() {
        let result = Cli::try_parse_from([
            "ups-agent",
            "--device-address",
            "10.0.0.5",
            "--username",
            "admin",
            "--password",
            "secret",
            "--victorialogs-username",
            "logs",
        ]);
        assert!(result.is_err());
    }
}
