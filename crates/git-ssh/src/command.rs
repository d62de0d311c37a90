//! Parsing of `exec` request payloads.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GitService {
    ReceivePack,
    UploadPack,
}

impl GitService {
    /// Name the client sends, e.g. `git-receive-pack`.
    pub fn command_name(self) -> &'static str {
        match self {
            GitService::ReceivePack => "git-receive-pack",
            GitService::UploadPack => "git-upload-pack",
        }
    }

    /// `git` subcommand that implements the service.
    pub fn subcommand(self) -> &'static str {
        match self {
            GitService::ReceivePack => "receive-pack",
            GitService::UploadPack => "upload-pack",
        }
    }
}

impl fmt::Display for GitService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecCommand {
    Ping,
    Git {
        service: GitService,
        repository: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unsupported command {0:?}")]
    Unknown(String),
    #[error("{0} requires a repository argument")]
    MissingRepository(GitService),
}

/// Drop `$` and turn backticks into plain quotes before anything else looks
/// at the payload.
pub fn sanitize(raw: &str) -> String {
    raw.replace('$', "").replace('`', "'")
}

impl ExecCommand {
    pub fn parse(payload: &str) -> Result<Self, CommandError> {
        let cleaned = sanitize(payload);
        let line = cleaned.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }

        let (name, argument) = match line.split_once(' ') {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let service = match name {
            "ping" => return Ok(ExecCommand::Ping),
            "git-receive-pack" => GitService::ReceivePack,
            "git-upload-pack" => GitService::UploadPack,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        if argument.is_empty() {
            return Err(CommandError::MissingRepository(service));
        }
        Ok(ExecCommand::Git {
            service,
            repository: argument.to_string(),
        })
    }

    /// Label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ExecCommand::Ping => "ping",
            ExecCommand::Git { service, .. } => service.command_name(),
        }
    }
}
