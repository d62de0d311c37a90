//! Push notifications sent from the receive hook to the build platform.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::identity::AUTH_HEADER;

/// One accepted ref update, as posted to the push endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    pub user: String,
    pub repository: String,
    pub revision: String,
    pub ref_name: String,
    pub fingerprint: String,
    pub ssh_connection: String,
    pub ssh_original_command: String,
}

/// A `<old> <new> <ref>` line from the hook's standard input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
    pub name: String,
}

impl RefUpdate {
    pub fn is_delete(&self) -> bool {
        self.new.bytes().all(|b| b == b'0')
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("malformed ref update line {0:?}")]
    MalformedRefUpdate(String),
    #[error("hook environment is missing {0}")]
    MissingEnv(&'static str),
    #[error("push notification failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("push endpoint answered with status {0}")]
    Status(u16),
}

pub fn parse_ref_updates(input: &str) -> Result<Vec<RefUpdate>, NotifyError> {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next(), fields.next(), fields.next()) {
                (Some(old), Some(new), Some(name), None) => Ok(RefUpdate {
                    old: old.to_string(),
                    new: new.to_string(),
                    name: name.to_string(),
                }),
                _ => Err(NotifyError::MalformedRefUpdate(line.to_string())),
            }
        })
        .collect()
}

/// Session metadata the executor exported into the hook's environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookContext {
    pub user: String,
    pub repository: String,
    pub fingerprint: String,
    pub ssh_connection: String,
    pub ssh_original_command: String,
}

impl HookContext {
    pub fn from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, NotifyError> {
        let required = |name: &'static str| lookup(name).ok_or(NotifyError::MissingEnv(name));
        Ok(Self {
            user: required("RECEIVE_USER")?,
            repository: required("RECEIVE_REPO")?,
            fingerprint: required("RECEIVE_FINGERPRINT")?,
            ssh_connection: lookup("SSH_CONNECTION").unwrap_or_default(),
            ssh_original_command: lookup("SSH_ORIGINAL_COMMAND").unwrap_or_default(),
        })
    }

    pub fn event_for(&self, update: &RefUpdate) -> PushEvent {
        PushEvent {
            user: self.user.clone(),
            repository: self.repository.clone(),
            revision: update.new.clone(),
            ref_name: update.name.clone(),
            fingerprint: self.fingerprint.clone(),
            ssh_connection: self.ssh_connection.clone(),
            ssh_original_command: self.ssh_original_command.clone(),
        }
    }
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, event: &PushEvent) -> Result<(), NotifyError>;
}

pub struct HttpNotifier {
    url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        Ok(Self {
            url: url.into(),
            token,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl PushNotifier for HttpNotifier {
    async fn notify(&self, event: &PushEvent) -> Result<(), NotifyError> {
        let mut request = self.client.post(&self.url).json(event);
        if let Some(token) = &self.token {
            request = request.header(AUTH_HEADER, token);
        }
        let status = request.send().await?.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::Status(status.as_u16()))
        }
    }
}

/// Send one event per non-delete update, stopping at the first failure.
/// Returns how many events were delivered.
pub async fn notify_ref_updates(
    notifier: &dyn PushNotifier,
    context: &HookContext,
    updates: &[RefUpdate],
) -> Result<usize, NotifyError> {
    let mut sent = 0;
    for update in updates {
        if update.is_delete() {
            tracing::debug!(ref_name = %update.name, "skipping ref deletion");
            continue;
        }
        notifier.notify(&context.event_for(update)).await?;
        sent += 1;
    }
    Ok(sent)
}
