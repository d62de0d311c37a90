//! On-disk bare repositories under the git home directory.

use std::io;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

/// Receive hook, re-rendered on every push so it tracks the current home.
const PRE_RECEIVE_TEMPLATE: &str = r#"#!/bin/sh
set -eu
GIT_HOME="{{git_home}}" exec builder hook pre-receive
"#;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepoNameError {
    #[error("empty repository name")]
    Empty,
    #[error("repository name {0:?} contains a parent-directory component")]
    Traversal(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("expected directory at {}, found file", .0.display())]
    NotADirectory(PathBuf),
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to initialize bare repository at {}: {message}", path.display())]
    Init { path: PathBuf, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Created,
    AlreadyExisted,
}

/// Normalize a client-supplied repository argument.
///
/// Quotes go first so that `'demo.git'` still loses its suffix.
pub fn clean_repo_name(raw: &str) -> Result<String, RepoNameError> {
    if raw.is_empty() {
        return Err(RepoNameError::Empty);
    }
    if raw.contains("..") {
        return Err(RepoNameError::Traversal(raw.to_string()));
    }
    let unquoted = raw.replace('\'', "");
    let name = unquoted
        .strip_suffix(".git")
        .unwrap_or(&unquoted)
        .trim_start_matches('/');
    if name.is_empty() {
        return Err(RepoNameError::Empty);
    }
    Ok(name.to_string())
}

pub fn render_pre_receive(home: &Path) -> String {
    PRE_RECEIVE_TEMPLATE.replace("{{git_home}}", &home.display().to_string())
}

pub struct RepoStore {
    home: PathBuf,
    // Guards check-and-create only; per-repository writes use the lock table.
    create_lock: Mutex<()>,
}

impl RepoStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            create_lock: Mutex::new(()),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn repository_path(&self, name: &str) -> PathBuf {
        self.home.join(format!("{name}.git"))
    }

    pub async fn ensure_bare(&self, name: &str) -> Result<Provisioned, RepoError> {
        let path = self.repository_path(name);
        let _guard = self.create_lock.lock().await;

        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => return Ok(Provisioned::AlreadyExisted),
            Ok(_) => return Err(RepoError::NotADirectory(path)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(RepoError::Io { path, source }),
        }

        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| RepoError::Io {
                path: path.clone(),
                source,
            })?;

        let target = path.clone();
        tokio::task::spawn_blocking(move || gix::init_bare(&target).map(drop))
            .await
            .map_err(|err| RepoError::Init {
                path: path.clone(),
                message: err.to_string(),
            })?
            .map_err(|err| RepoError::Init {
                path: path.clone(),
                message: err.to_string(),
            })?;

        tracing::info!(repo = %name, path = %path.display(), "initialized bare repository");
        Ok(Provisioned::Created)
    }

    /// Write `hooks/pre-receive` into the repository and make it executable.
    pub async fn write_pre_receive(&self, repo_path: &Path) -> Result<PathBuf, RepoError> {
        let hooks = repo_path.join("hooks");
        tokio::fs::create_dir_all(&hooks)
            .await
            .map_err(|source| RepoError::Io {
                path: hooks.clone(),
                source,
            })?;

        let hook = hooks.join("pre-receive");
        let io_err = |source| RepoError::Io {
            path: hook.clone(),
            source,
        };
        tokio::fs::write(&hook, render_pre_receive(&self.home))
            .await
            .map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755))
                .await
                .map_err(io_err)?;
        }

        Ok(hook)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn cleans_common_forms() {
        assert_eq!(clean_repo_name("demo").unwrap(), "demo");
        assert_eq!(clean_repo_name("demo.git").unwrap(), "demo");
        assert_eq!(clean_repo_name("'demo.git'").unwrap(), "demo");
        assert_eq!(clean_repo_name("/demo.git").unwrap(), "demo");
        assert_eq!(clean_repo_name("'/demo'").unwrap(), "demo");
    }

    #[test]
    fn rejects_traversal_and_empty_names() {
        assert_eq!(clean_repo_name(""), Err(RepoNameError::Empty));
        assert_eq!(clean_repo_name("''"), Err(RepoNameError::Empty));
        assert_eq!(clean_repo_name("/.git"), Err(RepoNameError::Empty));
        for name in ["..", "../etc", "demo/../../root", "'..'/x", "a..b"] {
            assert!(
                matches!(clean_repo_name(name), Err(RepoNameError::Traversal(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn hook_template_embeds_home() {
        let script = render_pre_receive(Path::new("/srv/git"));
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("GIT_HOME=\"/srv/git\""));
        assert!(script.contains("builder hook pre-receive"));
        assert!(!script.contains("{{"));
    }

    #[tokio::test]
    async fn ensure_bare_is_idempotent() {
        let home = TempDir::new().unwrap();
        let store = RepoStore::new(home.path());

        assert_eq!(store.ensure_bare("demo").await.unwrap(), Provisioned::Created);
        let path = store.repository_path("demo");
        assert!(path.join("HEAD").is_file());
        assert!(path.join("objects").is_dir());

        assert_eq!(
            store.ensure_bare("demo").await.unwrap(),
            Provisioned::AlreadyExisted
        );
    }

    #[tokio::test]
    async fn ensure_bare_refuses_plain_file() {
        let home = TempDir::new().unwrap();
        let store = RepoStore::new(home.path());
        std::fs::write(store.repository_path("demo"), b"not a repo").unwrap();

        let err = store.ensure_bare("demo").await.unwrap_err();
        assert!(matches!(err, RepoError::NotADirectory(_)));
        assert!(err.to_string().contains("expected directory"));
    }

    #[tokio::test]
    async fn concurrent_first_pushes_create_once() {
        let home = TempDir::new().unwrap();
        let store = std::sync::Arc::new(RepoStore::new(home.path()));

        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.ensure_bare("demo").await.unwrap() })
            })
            .collect();
        let mut created = 0;
        for attempt in attempts {
            if attempt.await.unwrap() == Provisioned::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn hook_is_rewritten_and_executable() {
        let home = TempDir::new().unwrap();
        let store = RepoStore::new(home.path());
        store.ensure_bare("demo").await.unwrap();
        let repo = store.repository_path("demo");

        let hook = repo.join("hooks").join("pre-receive");
        std::fs::write(&hook, "stale").unwrap();
        assert_eq!(store.write_pre_receive(&repo).await.unwrap(), hook);

        let body = std::fs::read_to_string(&hook).unwrap();
        assert_eq!(body, render_pre_receive(home.path()));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&hook).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
