//! Receive executor: runs `git receive-pack`/`upload-pack` for an authorized
//! channel while holding the repository lock.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use metrics::{counter, histogram};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::Permissions;
use crate::command::GitService;
use crate::lock::RepositoryLock;
use crate::pkt;
use crate::repo::{self, Provisioned, RepoError, RepoNameError, RepoStore};

pub const BUSY_MESSAGE: &str = "Another git push is ongoing";

const RELAY_BUFFER: usize = 32 * 1024;

/// Chunks of client input queued ahead of the subprocess. Once full, the
/// SSH layer stops consuming channel data and the client's window closes.
pub const STDIN_QUEUE_DEPTH: usize = 32;

/// Outbound half of an SSH channel.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn stdout(&self, data: &[u8]) -> io::Result<()>;
    async fn stderr(&self, data: &[u8]) -> io::Result<()>;
    async fn exit_status(&self, code: u32) -> io::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    InvalidName(#[from] RepoNameError),
    #[error("user {user} is not permitted to access {repository}")]
    Forbidden { user: String, repository: String },
    #[error(transparent)]
    Repository(#[from] RepoError),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("transfer failed: {0}")]
    Io(#[from] io::Error),
    #[error("{service} failed ({status}): {stderr}")]
    Process {
        service: GitService,
        status: String,
        stderr: String,
    },
    #[error("transfer cancelled")]
    Cancelled,
}

/// An authorized, sanitized repository operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveTarget {
    pub service: GitService,
    pub repository: String,
}

/// Per-session facts exported to the subprocess environment.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub permissions: Arc<Permissions>,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub original_command: String,
}

impl SessionInfo {
    /// `SSH_CONNECTION` format: client ip, client port, server ip, server port.
    pub fn ssh_connection(&self) -> String {
        format!(
            "{} {} {} {}",
            self.peer.ip(),
            self.peer.port(),
            self.local.ip(),
            self.local.port()
        )
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Program implementing the git services, normally `git`.
    pub git_program: PathBuf,
    /// Arguments placed before the service name.
    pub git_args: Vec<String>,
    /// Extra variables for the subprocess and the hooks it runs. The
    /// session variables are set after these and take precedence.
    pub env: Vec<(String, String)>,
    pub lock_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            git_program: PathBuf::from("git"),
            git_args: Vec::new(),
            env: Vec::new(),
            lock_timeout: Duration::ZERO,
        }
    }
}

pub struct Executor {
    store: RepoStore,
    lock: Arc<dyn RepositoryLock>,
    config: ExecutorConfig,
}

struct StderrCapture {
    bytes: Vec<u8>,
    unreported: bool,
}

impl Executor {
    pub fn new(store: RepoStore, lock: Arc<dyn RepositoryLock>, config: ExecutorConfig) -> Self {
        Self {
            store,
            lock,
            config,
        }
    }

    pub fn store(&self) -> &RepoStore {
        &self.store
    }

    /// Validate the requested name and check it against the session's
    /// permissions. Touches neither the filesystem nor the lock table.
    pub fn authorize(
        &self,
        service: GitService,
        raw_repository: &str,
        permissions: &Permissions,
    ) -> Result<ReceiveTarget, ReceiveError> {
        let repository = repo::clean_repo_name(raw_repository)?;
        if !permissions.allows(&repository) {
            return Err(ReceiveError::Forbidden {
                user: permissions.username.clone(),
                repository,
            });
        }
        Ok(ReceiveTarget {
            service,
            repository,
        })
    }

    /// Run the transfer and report an exit status on `sink`.
    ///
    /// Returns the status that was sent: 0 on success, 1 otherwise. The
    /// repository lock is released exactly once before the status goes out.
    pub async fn execute<S: ChannelSink + ?Sized>(
        &self,
        target: &ReceiveTarget,
        session: &SessionInfo,
        stdin: mpsc::Receiver<Bytes>,
        sink: &S,
        cancel: CancellationToken,
    ) -> u32 {
        let repo = target.repository.as_str();
        let user = session.permissions.username.as_str();

        if let Err(err) = self.lock.lock(repo, self.config.lock_timeout).await {
            tracing::warn!(%repo, %user, error = %err, "repository busy");
            counter!("git.receive", "outcome" => "busy").increment(1);
            if let Err(err) = sink.stderr(&pkt::error_line(BUSY_MESSAGE)).await {
                tracing::debug!(%repo, error = %err, "could not deliver busy message");
            }
            return self.report(sink, 1).await;
        }

        let held = HeldLock {
            lock: self.lock.clone(),
            name: Some(repo.to_string()),
            timeout: self.config.lock_timeout,
        };
        let started = Instant::now();
        let result = self.receive(target, session, stdin, sink, cancel).await;
        held.release().await;
        histogram!("git.receive_ms").record(started.elapsed().as_millis() as f64);

        let code = match result {
            Ok(()) => {
                tracing::info!(%repo, %user, service = %target.service, "transfer complete");
                counter!("git.receive", "outcome" => "ok").increment(1);
                0
            }
            Err(err) => {
                tracing::error!(%repo, %user, service = %target.service, error = %err, "transfer failed");
                counter!("git.receive", "outcome" => "error").increment(1);
                1
            }
        };
        self.report(sink, code).await
    }

    async fn report<S: ChannelSink + ?Sized>(&self, sink: &S, code: u32) -> u32 {
        if let Err(err) = sink.exit_status(code).await {
            tracing::debug!(error = %err, "could not deliver exit status");
        }
        code
    }

    async fn receive<S: ChannelSink + ?Sized>(
        &self,
        target: &ReceiveTarget,
        session: &SessionInfo,
        stdin: mpsc::Receiver<Bytes>,
        sink: &S,
        cancel: CancellationToken,
    ) -> Result<(), ReceiveError> {
        let path = self.store.repository_path(&target.repository);
        if self.store.ensure_bare(&target.repository).await? == Provisioned::AlreadyExisted {
            tracing::debug!(repo = %target.repository, "repository already present");
        }
        self.store.write_pre_receive(&path).await?;

        let permissions = &session.permissions;
        let mut child = Command::new(&self.config.git_program)
            .args(&self.config.git_args)
            .arg(target.service.subcommand())
            .arg(&path)
            .envs(self.config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("GIT_HOME", self.store.home())
            .env("RECEIVE_USER", &permissions.username)
            .env("RECEIVE_REPO", &target.repository)
            .env("RECEIVE_FINGERPRINT", &permissions.fingerprint)
            .env("SSH_ORIGINAL_COMMAND", &session.original_command)
            .env("SSH_CONNECTION", session.ssh_connection())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ReceiveError::Spawn {
                program: self.config.git_program.display().to_string(),
                source,
            })?;

        let (Some(child_stdin), Some(child_stdout), Some(child_stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(ReceiveError::Io(io::Error::other("subprocess pipes unavailable")));
        };

        // The feeder may block on a client that never sends EOF, so it runs
        // detached and is aborted once the subprocess is gone.
        let feeder = tokio::spawn(feed_stdin(stdin, child_stdin));
        let finished = tokio::select! {
            outcome = async {
                tokio::join!(
                    relay_stdout(child_stdout, sink),
                    relay_stderr(child_stderr, sink),
                    child.wait(),
                )
            } => Some(outcome),
            () = cancel.cancelled() => None,
        };
        feeder.abort();

        let Some((stdout, stderr, status)) = finished else {
            if let Err(err) = child.start_kill() {
                tracing::debug!(error = %err, "subprocess already exited");
            }
            return Err(ReceiveError::Cancelled);
        };

        let status = status?;
        let capture = stderr?;
        stdout?;

        if !status.success() || (capture.unreported && !capture.bytes.is_empty()) {
            return Err(ReceiveError::Process {
                service: target.service,
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&capture.bytes).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Holds a repository lock for the duration of a transfer. Dropping it
/// without `release` (unwind, cancelled future) still frees the repository.
struct HeldLock {
    lock: Arc<dyn RepositoryLock>,
    name: Option<String>,
    timeout: Duration,
}

impl HeldLock {
    async fn release(mut self) {
        if let Some(name) = self.name.take() {
            if let Err(err) = self.lock.unlock(&name, self.timeout).await {
                tracing::error!(repo = %name, error = %err, "repository lock vanished while held");
            }
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        let lock = self.lock.clone();
        let timeout = self.timeout;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if lock.unlock(&name, timeout).await.is_ok() {
                    tracing::warn!(repo = %name, "repository lock released after aborted transfer");
                }
            });
        }
    }
}

async fn feed_stdin(mut rx: mpsc::Receiver<Bytes>, mut stdin: ChildStdin) {
    while let Some(chunk) = rx.recv().await {
        if let Err(err) = stdin.write_all(&chunk).await {
            tracing::debug!(error = %err, "subprocess stopped reading input");
            return;
        }
    }
    // Dropping stdin delivers end-of-stream to the subprocess.
    if let Err(err) = stdin.shutdown().await {
        tracing::debug!(error = %err, "subprocess input already closed");
    }
}

async fn relay_stdout<S: ChannelSink + ?Sized>(mut out: ChildStdout, sink: &S) -> io::Result<()> {
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = out.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.stdout(&buf[..n]).await?;
    }
}

async fn relay_stderr<S: ChannelSink + ?Sized>(
    mut err: ChildStderr,
    sink: &S,
) -> io::Result<StderrCapture> {
    let mut capture = StderrCapture {
        bytes: Vec::new(),
        unreported: false,
    };
    let mut buf = vec![0u8; RELAY_BUFFER];
    loop {
        let n = err.read(&mut buf).await?;
        if n == 0 {
            return Ok(capture);
        }
        capture.bytes.extend_from_slice(&buf[..n]);
        if sink.stderr(&buf[..n]).await.is_err() {
            capture.unreported = true;
        }
    }
}
