//! SSH push gateway for git repositories.
//!
//! Authenticates clients by public key against an external identity
//! service, then runs `git receive-pack`/`upload-pack` for the repositories
//! the key is allowed to touch, one push per repository at a time.

pub mod auth;
pub mod circuit;
pub mod command;
pub mod exec;
pub mod lock;
pub mod notify;
pub mod pkt;
pub mod repo;
pub mod server;

pub use auth::{AuthGateway, Permissions};
pub use circuit::{Circuit, CircuitState};
pub use exec::{ChannelSink, Executor, ExecutorConfig};
pub use lock::{LockTable, RepositoryLock};
pub use server::{ServerState, SshServer};
