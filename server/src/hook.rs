//! `builder hook pre-receive`, invoked by the script written into every
//! repository's `hooks/` directory.

use anyhow::{Context, Result};
use git_ssh::notify::{self, HookContext, HttpNotifier, PushNotifier};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{Config, loader};

/// Notify the platform about every ref in `input`. An error rejects the push.
pub async fn run_pre_receive<R>(
    notifier: &dyn PushNotifier,
    context: &HookContext,
    mut input: R,
) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut buf = String::new();
    input
        .read_to_string(&mut buf)
        .await
        .context("Failed to read ref updates from stdin")?;

    let updates = notify::parse_ref_updates(&buf)?;
    let sent = notify::notify_ref_updates(notifier, context, &updates)
        .await
        .with_context(|| format!("Failed to notify push to {}", context.repository))?;

    tracing::info!(repo = %context.repository, user = %context.user, refs = sent, "push notified");
    Ok(sent)
}

/// Resolve the configuration the gateway exported through `BUILDER_CONFIG_PATH`,
/// with the same overrides and validation the server applied.
pub fn load_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    Ok(loader::load_with(None, lookup)?.config)
}

/// Entry point used by the CLI: environment from the process, refs from stdin.
pub async fn pre_receive(config: &Config) -> Result<()> {
    let context = HookContext::from_env(|name| std::env::var(name).ok())
        .context("pre-receive must run under the builder gateway")?;

    let Some(url) = &config.notify.url else {
        tracing::warn!(repo = %context.repository, "notify.url unset, accepting push without notification");
        return Ok(());
    };
    let notifier = HttpNotifier::new(url.clone(), config.notify.token(), config.notify.timeout())?;
    run_pre_receive(&notifier, &context, tokio::io::stdin()).await?;
    Ok(())
}
