/*
Task supervision. All long-running pieces (two pollers, the forwarder, the
cursor saver) run in one JoinSet under a shared cancellation token. The
first task failure, or the first termination signal, cancels the token;
everything else is expected to wind down within the grace period. Tasks
that ignore the grace period get the process pulled out from under them,
with a non-zero exit so the service manager notices.
*/

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Supervisor {
    shutdown: CancellationToken,
    tasks: JoinSet<(&'static str, anyhow::Result<()>)>,
    grace: Duration,
}

impl Supervisor {
    pub fn new(grace: Duration) -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
            grace,
        }
    }

    /// The token handed to every supervised task.
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Supervise until a termination signal or the first task exit, then
    /// cancel and drain the rest within the grace period.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;

        let mut failure: Option<anyhow::Error> = None;

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            _ = sigquit.recv() => info!("received SIGQUIT, shutting down"),
            joined = self.tasks.join_next() => {
                match joined {
                    Some(Ok((name, Ok(())))) => {
                        // Tasks only return cleanly on cancellation; an
                        // early clean exit still takes the agent down.
                        info!(task = name, "task finished, shutting down");
                    }
                    Some(Ok((name, Err(err)))) => {
                        error!(task = name, "task failed: {err:#}");
                        failure = Some(err);
                    }
                    Some(Err(err)) => {
                        error!("task panicked: {err}");
                        failure = Some(anyhow!(err));
                    }
                    None => {}
                }
            }
        }

        self.shutdown.cancel();

        let drain = async {
            while let Some(joined) = self.tasks.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => debug!(task = name, "task stopped"),
                    Ok((name, Err(err))) => error!(task = name, "task failed during shutdown: {err:#}"),
                    Err(err) => error!("task panicked during shutdown: {err}"),
                }
            }
        };

        if tokio::time::timeout(self.grace, drain).await.is_err() {
            error!(
                grace_ms = self.grace.as_millis() as u64,
                "tasks did not stop within the grace period, forcing exit"
            );
            std::process::exit(1);
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_failure_cancels_the_other_tasks() {
        let mut supervisor = Supervisor::new(Duration::from_secs(5));
        let token = supervisor.token();

        supervisor.spawn("waiter", {
            let token = token.clone();
            async move {
                token.cancelled().await;
                Ok(())
            }
        });
        supervisor.spawn("failer", async { Err(anyhow!("boom")) });

        let err = supervisor.run().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn clean_task_exit_stops_the_supervisor_without_error() {
        let mut supervisor = Supervisor::new(Duration::from_secs(5));
        let token = supervisor.token();

        supervisor.spawn("finisher", async { Ok(()) });
        supervisor.spawn("waiter", {
            let token = token.clone();
            async move {
                token.cancelled().await;
                Ok(())
            }
        });

        supervisor.run().await.unwrap();
        assert!(token.is_cancelled());
    }
}
