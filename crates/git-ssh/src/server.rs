//! SSH connection server.
//!
//! One task per accepted connection, one further task per channel running a
//! git service. Only `session` channels are opened; inside them `env` is
//! acknowledged and ignored, `exec` dispatches to ping or the receive
//! executor, and every other request is refused while the channel stays
//! open.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use metrics::counter;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthGateway, Permissions};
use crate::circuit::Circuit;
use crate::command::{ExecCommand, GitService};
use crate::exec::{ChannelSink, Executor, STDIN_QUEUE_DEPTH, SessionInfo};

pub const PING_REPLY: &[u8] = b"pong";

/// Extended-data stream code for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Everything a connection handler needs, shared across connections.
pub struct ServerState {
    pub gateway: AuthGateway,
    pub executor: Executor,
    pub circuit: Arc<Circuit>,
}

/// Read every configured host key. Any failure is fatal to startup.
pub fn load_host_keys(paths: &[PathBuf]) -> Result<Vec<PrivateKey>> {
    if paths.is_empty() {
        anyhow::bail!("no host keys configured");
    }
    paths
        .iter()
        .map(|path| {
            russh::keys::load_secret_key(path, None)
                .with_context(|| format!("failed to load host key {}", path.display()))
        })
        .collect()
}

pub fn ssh_config(keys: Vec<PrivateKey>, inactivity_timeout: Option<Duration>) -> russh::server::Config {
    russh::server::Config {
        keys,
        inactivity_timeout,
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    }
}

pub struct SshServer {
    config: Arc<russh::server::Config>,
    state: Arc<ServerState>,
}

impl SshServer {
    pub fn new(config: russh::server::Config, state: ServerState) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(state),
        }
    }

    /// Accept connections until `shutdown` fires. The circuit is closed while
    /// the loop runs and re-opened when it stops.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let bound = listener.local_addr().context("listener has no local address")?;
        if self.state.circuit.close() {
            tracing::info!(addr = %bound, "ssh listener accepting connections");
        }

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    counter!("ssh.connections").increment(1);
                    let local = stream.local_addr().unwrap_or(bound);
                    let handler = ConnectionHandler::new(self.state.clone(), peer, local);
                    tokio::spawn(run_connection(self.config.clone(), stream, handler));
                }
            }
        }

        self.state.circuit.open();
        tracing::info!(addr = %bound, "ssh listener stopped");
        Ok(())
    }
}

async fn run_connection(config: Arc<russh::server::Config>, stream: TcpStream, handler: ConnectionHandler) {
    let peer = handler.peer;
    tracing::debug!(%peer, "connection accepted");
    let session = match russh::server::run_stream(config, stream, handler).await {
        Ok(session) => session,
        Err(err) => {
            tracing::info!(%peer, error = %err, "handshake failed");
            return;
        }
    };
    match session.await {
        Ok(()) => tracing::debug!(%peer, "connection closed"),
        Err(err) => tracing::info!(%peer, error = %err, "connection closed with error"),
    }
}

#[derive(Default)]
struct ChannelSlot {
    stdin: Option<mpsc::Sender<Bytes>>,
    cancel: CancellationToken,
    running: bool,
}

/// Queue one chunk of client input for the subprocess, waiting while the
/// queue is full. Holding the handler here stops russh reading the socket
/// so the client's window stays closed until the subprocess catches up.
async fn forward_input(stdin: &mpsc::Sender<Bytes>, data: &[u8]) {
    if stdin.send(Bytes::copy_from_slice(data)).await.is_err() {
        tracing::debug!(len = data.len(), "subprocess exited, dropping client input");
    }
}

pub struct ConnectionHandler {
    state: Arc<ServerState>,
    peer: SocketAddr,
    local: SocketAddr,
    permissions: Option<Arc<Permissions>>,
    channels: HashMap<ChannelId, ChannelSlot>,
}

impl ConnectionHandler {
    fn new(state: Arc<ServerState>, peer: SocketAddr, local: SocketAddr) -> Self {
        Self {
            state,
            peer,
            local,
            permissions: None,
            channels: HashMap::new(),
        }
    }

    fn deny(channel: ChannelId, session: &mut Session) -> Result<()> {
        session.channel_failure(channel)?;
        session.close(channel)?;
        Ok(())
    }

    fn ping(&self, channel: ChannelId, session: &mut Session) -> Result<()> {
        tracing::info!(peer = %self.peer, "ping");
        session.data(channel, CryptoVec::from_slice(PING_REPLY))?;
        session.exit_status_request(channel, 0)?;
        session.channel_success(channel)?;
        session.eof(channel)?;
        session.close(channel)?;
        Ok(())
    }

    fn start_git(
        &mut self,
        channel: ChannelId,
        service: GitService,
        repository: &str,
        original_command: String,
        session: &mut Session,
    ) -> Result<()> {
        let Some(permissions) = self.permissions.clone() else {
            return Self::deny(channel, session);
        };
        let target = match self.state.executor.authorize(service, repository, &permissions) {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(
                    peer = %self.peer,
                    user = %permissions.username,
                    %service,
                    error = %err,
                    "request denied"
                );
                return Self::deny(channel, session);
            }
        };
        let Some(slot) = self.channels.get_mut(&channel) else {
            return Self::deny(channel, session);
        };
        if slot.running {
            tracing::warn!(peer = %self.peer, ?channel, "channel is already running a command");
            session.channel_failure(channel)?;
            return Ok(());
        }

        let (tx, rx) = mpsc::channel(STDIN_QUEUE_DEPTH);
        slot.stdin = Some(tx);
        slot.running = true;
        let cancel = slot.cancel.clone();
        session.channel_success(channel)?;

        tracing::info!(
            peer = %self.peer,
            user = %permissions.username,
            repo = %target.repository,
            %service,
            "starting transfer"
        );
        let sink = SessionSink {
            handle: session.handle(),
            channel,
        };
        let info = SessionInfo {
            permissions,
            peer: self.peer,
            local: self.local,
            original_command,
        };
        let state = self.state.clone();
        tokio::spawn(async move {
            let transfer = {
                let sink = sink.clone();
                tokio::spawn(async move {
                    state.executor.execute(&target, &info, rx, &sink, cancel).await
                })
            };
            if let Err(err) = transfer.await {
                // A panicking transfer only takes its own channel down.
                tracing::error!(?channel, error = %err, "transfer task aborted");
                if let Err(err) = sink.exit_status(1).await {
                    tracing::debug!(?channel, error = %err, "could not report aborted transfer");
                }
            }
            sink.finish().await;
        });
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        for slot in self.channels.values() {
            slot.cancel.cancel();
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        match self.state.gateway.authenticate_key(public_key).await {
            Ok(permissions) => {
                tracing::info!(
                    peer = %self.peer,
                    ssh_user = %user,
                    user = %permissions.username,
                    fingerprint = %permissions.fingerprint,
                    "public key accepted"
                );
                counter!("ssh.auth", "outcome" => "accepted").increment(1);
                self.permissions = Some(Arc::new(permissions));
                Ok(Auth::Accept)
            }
            Err(err) => {
                tracing::warn!(
                    peer = %self.peer,
                    ssh_user = %user,
                    fingerprint = err.fingerprint().unwrap_or("-"),
                    error = %err,
                    "public key rejected"
                );
                counter!("ssh.auth", "outcome" => "rejected").increment(1);
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        if self.permissions.is_none() {
            return Ok(false);
        }
        tracing::debug!(peer = %self.peer, channel = ?channel.id(), "session channel opened");
        self.channels.insert(channel.id(), ChannelSlot::default());
        Ok(true)
    }

    // russh answers a refused typed channel with ADMINISTRATIVELY_PROHIBITED;
    // UNKNOWN_CHANNEL_TYPE is only sent for types it cannot parse.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool> {
        tracing::warn!(
            peer = %self.peer,
            channel = ?channel.id(),
            host = %host_to_connect,
            port = port_to_connect,
            "port forwarding refused"
        );
        counter!("ssh.channel_refused", "type" => "direct-tcpip").increment(1);
        Ok(false)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<()> {
        tracing::debug!(peer = %self.peer, ?channel, name = %variable_name, "env request ignored");
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let original_command = String::from_utf8_lossy(data).into_owned();
        let command = match ExecCommand::parse(&original_command) {
            Ok(command) => command,
            Err(err) => {
                tracing::warn!(peer = %self.peer, ?channel, error = %err, "exec denied");
                counter!("ssh.exec", "command" => "rejected").increment(1);
                return Self::deny(channel, session);
            }
        };
        counter!("ssh.exec", "command" => command.label()).increment(1);

        match command {
            ExecCommand::Ping => self.ping(channel, session),
            ExecCommand::Git {
                service,
                repository,
            } => self.start_git(channel, service, &repository, original_command, session),
        }
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        tracing::debug!(peer = %self.peer, ?channel, "shell request refused");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        tracing::debug!(peer = %self.peer, ?channel, subsystem = %name, "subsystem request refused");
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<()> {
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<()> {
        let stdin = self.channels.get(&channel).and_then(|slot| slot.stdin.clone());
        if let Some(stdin) = stdin {
            forward_input(&stdin, data).await;
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(slot) = self.channels.get_mut(&channel) {
            slot.stdin = None;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(slot) = self.channels.remove(&channel) {
            slot.cancel.cancel();
        }
        Ok(())
    }
}

#[derive(Clone)]
struct SessionSink {
    handle: Handle,
    channel: ChannelId,
}

impl SessionSink {
    async fn finish(&self) {
        if self.handle.eof(self.channel).await.is_err() {
            tracing::debug!(channel = ?self.channel, "channel gone before eof");
        }
        if self.handle.close(self.channel).await.is_err() {
            tracing::debug!(channel = ?self.channel, "channel gone before close");
        }
    }
}

fn channel_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "ssh channel closed")
}

#[async_trait]
impl ChannelSink for SessionSink {
    async fn stdout(&self, data: &[u8]) -> io::Result<()> {
        self.handle
            .data(self.channel, CryptoVec::from_slice(data))
            .await
            .map_err(|_| channel_gone())
    }

    async fn stderr(&self, data: &[u8]) -> io::Result<()> {
        self.handle
            .extended_data(self.channel, SSH_EXTENDED_DATA_STDERR, CryptoVec::from_slice(data))
            .await
            .map_err(|_| channel_gone())
    }

    async fn exit_status(&self, code: u32) -> io::Result<()> {
        self.handle
            .exit_status_request(self.channel, code)
            .await
            .map_err(|_| channel_gone())
    }
}
