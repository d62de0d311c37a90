//! Configuration for the builder gateway
//!
//! Stored in RON. Every section has defaults, so a file only needs to name the
//! values it changes.

pub mod loader;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_HOST_KEYS: &[&str] = &[
    "/var/run/secrets/api/ssh/ssh_host_rsa_key",
    "/var/run/secrets/api/ssh/ssh_host_ecdsa_key",
    "/var/run/secrets/api/ssh/ssh_host_ed25519_key",
];

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub ssh: Ssh,
    #[serde(default)]
    pub git: Git,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub notify: Notify,
    #[serde(default)]
    pub health: Health,
}

/// SSH listener settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Ssh {
    /// Address the gateway accepts connections on
    pub listen: String,

    /// Host private keys; every entry must load or startup fails
    pub host_keys: Vec<PathBuf>,

    /// Idle connections are dropped after this many seconds
    pub inactivity_timeout_secs: Option<u64>,

    /// How long a push waits for another push to the same repository
    pub lock_timeout_ms: u64,
}

impl Default for Ssh {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2223".to_string(),
            host_keys: DEFAULT_HOST_KEYS.iter().map(PathBuf::from).collect(),
            inactivity_timeout_secs: Some(600),
            lock_timeout_ms: 0,
        }
    }
}

impl Ssh {
    pub fn inactivity_timeout(&self) -> Option<Duration> {
        self.inactivity_timeout_secs.map(Duration::from_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Repository storage and the program serving git transfers
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Git {
    pub home: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for Git {
    fn default() -> Self {
        Self {
            home: PathBuf::from("/home/git"),
            program: PathBuf::from("git"),
            args: Vec::new(),
        }
    }
}

/// Key lookup service consulted during the SSH handshake
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Identity {
    pub url: String,

    /// Environment variable holding the shared secret
    pub token_env: Option<String>,

    pub timeout_secs: u64,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            url: "http://controller:8000".to_string(),
            token_env: Some("BUILDER_KEY".to_string()),
            timeout_secs: 10,
        }
    }
}

impl Identity {
    pub fn token(&self) -> Option<String> {
        resolve_token(self.token_env.as_deref())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Push notification endpoint used by the receive hook
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Notify {
    /// Notifications are skipped when unset
    pub url: Option<String>,
    pub token_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for Notify {
    fn default() -> Self {
        Self {
            url: Some("http://controller:8000/v2/hooks/push".to_string()),
            token_env: Some("BUILDER_KEY".to_string()),
            timeout_secs: 30,
        }
    }
}

impl Notify {
    pub fn token(&self) -> Option<String> {
        resolve_token(self.token_env.as_deref())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Health {
    pub listen: String,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8092".to_string(),
        }
    }
}

impl Config {
    /// Apply `GIT_HOME` and `BUILDER_SSH_LISTEN` on top of file values
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(home) = lookup("GIT_HOME").filter(|v| !v.is_empty()) {
            self.git.home = PathBuf::from(home);
        }
        if let Some(listen) = lookup("BUILDER_SSH_LISTEN").filter(|v| !v.is_empty()) {
            self.ssh.listen = listen;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_listen("ssh.listen", &self.ssh.listen)?;
        validate_listen("health.listen", &self.health.listen)?;

        if self.ssh.host_keys.is_empty() {
            return Err("ssh.host_keys cannot be empty".to_string());
        }
        if !self.git.home.is_absolute() {
            return Err(format!(
                "git.home '{}' must be an absolute path",
                self.git.home.display()
            ));
        }
        if self.git.program.as_os_str().is_empty() {
            return Err("git.program cannot be empty".to_string());
        }
        if self.identity.url.is_empty() {
            return Err("identity.url cannot be empty".to_string());
        }
        Ok(())
    }
}

fn validate_listen(field: &str, value: &str) -> Result<(), String> {
    value
        .parse::<SocketAddr>()
        .map(drop)
        .map_err(|err| format!("{field} '{value}' is not a socket address: {err}"))
}

fn resolve_token(env: Option<&str>) -> Option<String> {
    std::env::var(env?).ok().filter(|token| !token.is_empty())
}
