use log::{debug, warn};

use rmoci::error::{Error, Result};

use crate::config::SyncStep;
use crate::template;

/// Run one step hook through the shell with the step's source and target in
/// the environment. Hook failures are surfaced to the caller; whether they
/// abort depends on which hook it was.
pub async fn run(kind: &str, cmd: &str, step: &SyncStep) -> Result<()> {
    let cmd = template::expand(cmd, None, Some(step))?;
    debug!("running {kind} hook: {cmd}");
    let status = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&cmd)
        .env("RMSYNC_SOURCE", &step.source)
        .env("RMSYNC_TARGET", &step.target)
        .env("RMSYNC_HOOK", kind)
        .status()
        .await?;
    if !status.success() {
        return Err(Error::InvalidInput(format!(
            "{kind} hook exited with {status}: {cmd}"
        )));
    }
    Ok(())
}

/// post/unchanged hooks only warn; the sync itself already finished.
pub async fn run_soft(kind: &str, cmd: &str, step: &SyncStep) {
    if let Err(e) = run(kind, cmd, step).await {
        warn!("{kind} hook failed source={} error={e:?}", step.source);
    }
}
