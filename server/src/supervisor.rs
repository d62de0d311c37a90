//! Runs the gateway's listeners (SSH and health) and tears all of them down
//! when one fails or the process is interrupted.
//!
//! After shutdown starts, listeners get a drain period to finish in-flight
//! work. Whatever is still running when it ends is aborted.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Error, Result, anyhow};
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_DRAIN: Duration = Duration::from_secs(10);

pub struct Supervisor {
    shutdown: CancellationToken,
    tasks: JoinSet<Result<()>>,
    names: HashMap<task::Id, &'static str>,
    drain: Duration,
    deadline: Option<Instant>,
    aborted: bool,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tasks: JoinSet::new(),
            names: HashMap::new(),
            drain: DEFAULT_DRAIN,
            deadline: None,
            aborted: false,
        }
    }

    pub fn with_drain(mut self, drain: Duration) -> Self {
        self.drain = drain;
        self
    }

    pub fn spawn<F, Fut>(&mut self, name: &'static str, factory: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let shutdown = self.shutdown.child_token();
        let handle = self.tasks.spawn(async move { factory(shutdown).await });
        self.names.insert(handle.id(), name);
    }

    /// Wait for every task. The first failure, tagged with the name of the
    /// task that produced it, is returned once all of them are gone.
    pub async fn run(mut self) -> Result<()> {
        let mut first_err: Option<Error> = None;

        loop {
            let deadline = self.deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                joined = self.tasks.join_next_with_id() => {
                    let Some(joined) = joined else { break };
                    if let Err(err) = self.record(joined) {
                        first_err.get_or_insert(err);
                        self.begin_shutdown("task failed");
                    }
                }
                _ = tokio::signal::ctrl_c(), if !self.shutdown.is_cancelled() => {
                    self.begin_shutdown("interrupt received");
                }
                _ = tokio::time::sleep_until(deadline), if self.deadline.is_some() && !self.aborted => {
                    self.abort_stragglers();
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn begin_shutdown(&mut self, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::warn!(reason, drain = ?self.drain, "supervisor shutting down");
        self.shutdown.cancel();
        self.deadline = Some(Instant::now() + self.drain);
    }

    fn abort_stragglers(&mut self) {
        for name in self.names.values() {
            tracing::warn!(task = %name, "task did not stop within drain period, aborting");
        }
        self.aborted = true;
        self.tasks.abort_all();
    }

    fn name_of(&mut self, id: task::Id) -> &'static str {
        self.names.remove(&id).unwrap_or("unnamed")
    }

    fn record(&mut self, joined: std::result::Result<(task::Id, Result<()>), JoinError>) -> Result<()> {
        match joined {
            Ok((id, Ok(()))) => {
                let name = self.name_of(id);
                tracing::info!(task = %name, "task exited gracefully");
                Ok(())
            }
            Ok((id, Err(err))) => {
                let name = self.name_of(id);
                tracing::error!(task = %name, error = %err, "task exited with error");
                Err(err).with_context(|| format!("{name} task failed"))
            }
            Err(join_err) if join_err.is_cancelled() => {
                let name = self.name_of(join_err.id());
                tracing::debug!(task = %name, "task aborted");
                Ok(())
            }
            Err(join_err) => {
                let name = self.name_of(join_err.id());
                tracing::error!(task = %name, error = ?join_err, "task panicked");
                Err(anyhow!("{name} task panicked: {join_err}"))
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
