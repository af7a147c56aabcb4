use std::sync::Arc;

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use rmoci::copy::{CopyOpts, image_copy};
use rmoci::error::{Error, Result};
use rmoci::manifest::is_index_media_type;
use rmoci::{Client, ManifestCache, Reference, ReferrerFilter, Throttle};

use crate::config::SyncStep;
use crate::template;

/// Everything a reconciliation needs, threaded explicitly instead of living
/// in globals. One of these per run; the token is the run's root context.
pub struct Ctx {
    pub client: Arc<Client>,
    pub throttle: Throttle,
    pub cache: ManifestCache,
    pub cancel: CancellationToken,
    pub abort_on_error: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Check,
    Copy,
    Missing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Copied,
    Matched,
    Skipped,
}

/// Reconcile one `(src, tgt)` pair: decide between no-op, refresh, sync,
/// and backup-then-overwrite, then hand the actual transfer to `image_copy`.
pub async fn sync_ref(
    ctx: &Ctx,
    step: &SyncStep,
    src: &Reference,
    tgt: &Reference,
    action: Action,
) -> Result<Outcome> {
    // source probe; registries that return no digest on HEAD get a GET
    let src_desc = match ctx.client.manifest_head(src).await {
        Ok(d) => d,
        Err(Error::UnsupportedApi(_)) => {
            let m = ctx.client.manifest_get(src).await?;
            ctx.cache.insert(&m).await;
            m.descriptor().clone()
        }
        Err(e) => return Err(e),
    };

    // target probe: absent, matching, or different
    let tgt_desc = match ctx.client.manifest_head(tgt).await {
        Ok(d) => Some(d),
        Err(Error::UnsupportedApi(_)) => ctx
            .client
            .manifest_get(tgt)
            .await
            .ok()
            .map(|m| m.descriptor().clone()),
        Err(_) => None,
    };
    let present = tgt_desc.is_some();
    let mut matched = tgt_desc
        .as_ref()
        .map(|d| d.digest() == src_desc.digest())
        .unwrap_or(false);

    if action == Action::Missing && present {
        debug!(
            "missing mode, target exists source={} target={}",
            src.common_name(),
            tgt.common_name()
        );
        return Ok(Outcome::Skipped);
    }

    let referrers = step.referrers.unwrap_or(false);
    let digest_tags = step.digest_tags.unwrap_or(false);
    let force_recursive = step.force_recursive.unwrap_or(false);
    let fast_check = step.fast_check.unwrap_or(false);
    if matched && (fast_check || (!force_recursive && !referrers && !digest_tags)) {
        info!(
            "image matches source={} target={}",
            src.common_name(),
            tgt.common_name()
        );
        return Ok(Outcome::Matched);
    }

    let src_media_type = src_desc.media_type().to_string();
    if !step.media_type_allowed(&src_media_type) {
        info!(
            "skipping unmatched media type source={} mediaType={}",
            src.common_name(),
            src_media_type
        );
        return Ok(Outcome::Skipped);
    }

    // a single-platform step pins the source to the index child
    let mut src = src.clone();
    if is_index_media_type(&src_media_type) {
        if let Some(platform) = step.platform.as_deref() {
            let dig = src_desc.digest().to_string();
            let m = match ctx.cache.get(&dig).await {
                Some(m) => m,
                None => {
                    let m = ctx.client.manifest_get(&src.with_digest(&dig)?).await?;
                    ctx.cache.insert(&m).await;
                    m
                }
            };
            let child = m
                .platform_descriptor(platform)?
                .ok_or_else(|| {
                    Error::NotFound(format!("platform {platform} in {}", src.common_name()))
                })?
                .clone();
            src = src.with_digest(&child.digest().to_string())?;
            matched = tgt_desc
                .as_ref()
                .map(|d| d.digest() == child.digest())
                .unwrap_or(false);
            if matched && !force_recursive {
                info!(
                    "image matches for platform source={} platform={platform}",
                    src.common_name()
                );
                return Ok(Outcome::Matched);
            }
        }
    }

    if action == Action::Check {
        info!(
            "sync needed source={} target={}",
            src.common_name(),
            tgt.common_name()
        );
        return Ok(Outcome::Copied);
    }

    let mut slot = ctx.throttle.acquire(&ctx.cancel).await?;

    // wait out the source rate limit before burning requests on a copy
    let min = step.rate_limit_min();
    if min > 0 && ctx.client.rate_limit(&src).await.is_some() {
        // refresh the remaining count before deciding to wait
        ctx.client.manifest_head(&src).await?;
        let retry = step.rate_limit_retry();
        loop {
            match ctx.client.rate_limit(&src).await {
                Some(rl) if rl.remaining < min => {
                    info!(
                        "waiting for rate limit source={} remaining={} required={min}",
                        src.common_name(),
                        rl.remaining
                    );
                    slot.release();
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(Error::Canceled),
                        _ = tokio::time::sleep(retry) => {}
                    }
                    slot = ctx.throttle.acquire(&ctx.cancel).await?;
                    // refresh the headers; a failure here gives up on this
                    // reference without touching its siblings
                    ctx.client.manifest_head(&src).await?;
                }
                _ => break,
            }
        }
    }

    // a shutdown between admission and the copy must not start new work
    if ctx.cancel.is_cancelled() {
        return Err(Error::Canceled);
    }

    if present && !matched {
        if let Some(backup) = step.backup.as_deref().filter(|b| !b.is_empty()) {
            let backup_ref = backup_reference(backup, tgt, step)?;
            info!(
                "backing up target={} backup={}",
                tgt.common_name(),
                backup_ref.common_name()
            );
            if let Err(e) =
                image_copy(&ctx.client, tgt, &backup_ref, &CopyOpts::default(), &ctx.cancel).await
            {
                // the source data wins; a failed backup is not fatal
                warn!(
                    "backup failed, overwriting anyway target={} backup={} error={e:?}",
                    tgt.common_name(),
                    backup_ref.common_name()
                );
            }
        }
    }

    if matched {
        info!(
            "refreshing target source={} target={}",
            src.common_name(),
            tgt.common_name()
        );
    } else {
        info!(
            "sync needed source={} target={}",
            src.common_name(),
            tgt.common_name()
        );
    }
    let opts = copy_opts(step)?;
    image_copy(&ctx.client, &src, tgt, &opts, &ctx.cancel).await?;
    slot.release();
    Ok(Outcome::Copied)
}

/// A backup template expanding to something with `:` or `/` is a full
/// reference; anything else is a tag on the target repository.
fn backup_reference(tpl: &str, tgt: &Reference, step: &SyncStep) -> Result<Reference> {
    let expanded = template::expand(tpl, Some(tgt), Some(step))?;
    if expanded.contains(':') || expanded.contains('/') {
        Reference::parse(&expanded)
    } else {
        tgt.with_tag(&expanded)
    }
}

fn copy_opts(step: &SyncStep) -> Result<CopyOpts> {
    let referrer_src = match step.referrer_source.as_deref() {
        Some(s) => Some(Reference::parse(&template::expand(s, None, Some(step))?)?),
        None => None,
    };
    let referrer_tgt = match step.referrer_target.as_deref() {
        Some(s) => Some(Reference::parse(&template::expand(s, None, Some(step))?)?),
        None => None,
    };
    Ok(CopyOpts {
        platforms: step.platforms.clone(),
        referrers: step.referrers.unwrap_or(false),
        referrer_filters: step.referrer_filters.iter().map(ReferrerFilter::from).collect(),
        referrer_src,
        referrer_tgt,
        digest_tags: step.digest_tags.unwrap_or(false),
        force_recursive: step.force_recursive.unwrap_or(false),
        include_external: step.include_external.unwrap_or(false),
        blob_limit: step.blob_limit.unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_reference_forms() {
        let tgt = Reference::parse("registry.example.org/app:latest").unwrap();
        let step = SyncStep::default();

        let tag = backup_reference("old-{{ Ref.Tag }}", &tgt, &step).unwrap();
        assert_eq!(tag.common_name(), "registry.example.org/app:old-latest");

        let full = backup_reference(
            "ocidir://backups:{{ Ref.Tag }}",
            &tgt,
            &step,
        )
        .unwrap();
        assert_eq!(full.common_name(), "ocidir://backups:latest");

        let repo = backup_reference("registry.example.org/backups:x", &tgt, &step).unwrap();
        assert_eq!(repo.repository, "backups");
    }
}
