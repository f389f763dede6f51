use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod cli;
mod device;
mod poll;
mod resilience;
mod sink;
mod state;
mod util;

use crate::app::Supervisor;
use crate::device::{Credentials, Session, SessionOptions};
use crate::poll::{MetricForwarder, MetricPoller, NotificationPoller};
use crate::sink::{InfluxSink, VictoriaLogsAuth, VictoriaLogsSink};
use crate::state::{CursorStore, PeriodicSaver};

fn initialize_tracing() {
    // Initialize tracing subscriber for human-readable logs
    tracing_subscriber::registry()
        .with(
            // Use some log defaults. These can be overriden using
            // RUST_LOG
            EnvFilter::try_from_default_env().unwrap_or(
                EnvFilter::default()
                    .add_directive("info".parse().unwrap())
                    .add_directive("hyper=error".parse().unwrap())
                    .add_directive("reqwest=warn".parse().unwrap()),
            ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .event_format(fmt::format().compact().with_target(false)),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    initialize_tracing();

    let cli = cli::parse();

    let session = Arc::new(
        Session::new(
            format!("https://{}", cli.device_address),
            Credentials {
                username: cli.username.clone(),
                password: cli.password.clone(),
            },
            SessionOptions {
                request_timeout: cli.request_timeout,
                call_deadline: cli.call_deadline,
                quick_retries: cli.quick_retries,
                quick_retry_delay: cli.quick_retry_delay,
                notification_page_size: cli.notification_page_size,
            },
        )
        .context("failed to build device client")?,
    );

    // Fail fast on bad credentials or an unreachable device; the service
    // manager owns restarts.
    session
        .login()
        .await
        .context("initial device login failed")?;

    let (store, cursor) = CursorStore::open(&cli.state_file)
        .with_context(|| format!("failed to open state file {}", cli.state_file.display()))?;
    info!(cursor, "loaded notification cursor");
    let saver = Arc::new(PeriodicSaver::new(store, cursor));

    let influx = InfluxSink::new(&cli.influx_url, &cli.influx_database, cli.request_timeout)
        .context("failed to build influxdb sink")?;

    let victorialogs_auth = cli
        .victorialogs_username
        .clone()
        .zip(cli.victorialogs_password.clone())
        .map(|(username, password)| VictoriaLogsAuth { username, password });
    let victorialogs =
        VictoriaLogsSink::new(&cli.victorialogs_url, victorialogs_auth, cli.request_timeout)
            .context("failed to build victorialogs sink")?;

    // Capacity of one: a slow metrics store stalls polling rather than
    // queueing snapshots.
    let (jobs_tx, jobs_rx) = mpsc::channel(1);

    let mut supervisor = Supervisor::new(cli.shutdown_grace);

    let metric_poller = MetricPoller::new(session.clone(), cli.poll_interval, jobs_tx);
    supervisor.spawn("metric-poller", {
        let token = supervisor.token();
        async move {
            metric_poller.run(token).await?;
            Ok(())
        }
    });

    let forwarder = MetricForwarder::new(Box::new(influx), jobs_rx);
    supervisor.spawn("metric-forwarder", {
        let token = supervisor.token();
        async move {
            forwarder.run(token).await?;
            Ok(())
        }
    });

    let notification_poller = NotificationPoller::new(
        session,
        Box::new(victorialogs),
        saver.clone(),
        cli.poll_interval,
        cli.device_address.clone(),
    );
    supervisor.spawn("notification-poller", {
        let token = supervisor.token();
        async move {
            notification_poller.run(token).await?;
            Ok(())
        }
    });

    supervisor.spawn("cursor-saver", {
        let token = supervisor.token();
        let save_interval = cli.save_interval;
        async move {
            saver.run(save_interval, token).await?;
            Ok(())
        }
    });

    supervisor.run().await
}
