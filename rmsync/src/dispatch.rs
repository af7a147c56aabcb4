use log::{debug, error, info, warn};

use rmoci::Reference;
use rmoci::error::{Error, Result};

use crate::cleanup;
use crate::config::{StepScope, SyncStep};
use crate::filter;
use crate::hooks;
use crate::sync::{Action, Ctx, Outcome, sync_ref};
use crate::template;

/// Expand a step into concrete references and reconcile each of them.
pub async fn run_step(ctx: &Ctx, step: &SyncStep, action: Action) -> Result<()> {
    // hooks only fire for runs that may change the target
    let hooks_active = action != Action::Check;
    if hooks_active {
        if let Some(pre) = step.hooks.as_ref().and_then(|h| h.pre.as_deref()) {
            hooks::run("pre", pre, step).await?;
        }
    }
    let res = match step.scope {
        StepScope::Image => run_image(ctx, step, action).await,
        StepScope::Repository => {
            let (src, tgt) = step_refs(step)?;
            run_repository(ctx, step, action, src, tgt).await
        }
        StepScope::Registry => run_registry(ctx, step, action).await,
    };
    if hooks_active {
        match &res {
            Ok(0) => {
                if let Some(unchanged) = step.hooks.as_ref().and_then(|h| h.unchanged.as_deref()) {
                    hooks::run_soft("unchanged", unchanged, step).await;
                }
            }
            Ok(_) => {
                if let Some(post) = step.hooks.as_ref().and_then(|h| h.post.as_deref()) {
                    hooks::run_soft("post", post, step).await;
                }
            }
            Err(_) => {}
        }
    }
    res.map(|_| ())
}

fn step_refs(step: &SyncStep) -> Result<(Reference, Reference)> {
    let src = Reference::parse(&template::expand(&step.source, None, Some(step))?)?;
    let tgt = Reference::parse(&template::expand(&step.target, None, Some(step))?)?;
    Ok((src, tgt))
}

async fn run_image(ctx: &Ctx, step: &SyncStep, action: Action) -> Result<usize> {
    let (src, tgt) = step_refs(step)?;
    let res = sync_ref(ctx, step, &src, &tgt, action).await;
    if let Err(e) = ctx.client.close(&tgt).await {
        warn!("close failed target={} error={e:?}", tgt.common_name());
    }
    res.map(|o| usize::from(o == Outcome::Copied))
}

async fn run_repository(
    ctx: &Ctx,
    step: &SyncStep,
    action: Action,
    src: Reference,
    tgt: Reference,
) -> Result<usize> {
    let src_tags = ctx.client.tag_list(&src).await?;
    let mut tags = filter::filter_list(&step.tags, &src_tags)?;
    if action == Action::Missing {
        let tgt_tags = match ctx.client.tag_list(&tgt).await {
            Ok(tags) => tags,
            // a target that does not exist yet has no tags
            Err(Error::NotFound(_)) | Err(Error::ParseError(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        tags = prune_existing(tags, &tgt_tags);
    }

    let mut errs = Vec::new();
    let mut copied = 0usize;
    for tag in &tags {
        if ctx.cancel.is_cancelled() {
            errs.push(Error::Canceled);
            break;
        }
        let src_tag = src.with_tag(tag)?;
        let tgt_tag = tgt.with_tag(tag)?;
        match sync_ref(ctx, step, &src_tag, &tgt_tag, action).await {
            Ok(Outcome::Copied) => copied += 1,
            Ok(_) => {}
            Err(e) => {
                error!(
                    "reconcile failed source={} target={} error={e:?}",
                    src_tag.common_name(),
                    tgt_tag.common_name()
                );
                let canceled = e.is_canceled();
                errs.push(e);
                if ctx.abort_on_error && !canceled {
                    ctx.cancel.cancel();
                    break;
                }
            }
        }
    }

    if step.cleanup.unwrap_or(false) && action != Action::Check && !ctx.cancel.is_cancelled() {
        if let Err(e) = cleanup::run(ctx, step, &tgt).await {
            errs.push(e);
        }
    }

    if let Err(e) = ctx.client.close(&tgt).await {
        warn!("close failed target={} error={e:?}", tgt.common_name());
    }
    Error::join(errs)?;
    Ok(copied)
}

/// Missing-mode set difference: walk both sorted tag lists from the top,
/// dropping source tags the target already has. Unmatched entries only
/// advance their own side.
fn prune_existing(mut src: Vec<String>, tgt: &[String]) -> Vec<String> {
    let mut i = src.len();
    let mut j = tgt.len();
    while i > 0 && j > 0 {
        match src[i - 1].cmp(&tgt[j - 1]) {
            std::cmp::Ordering::Equal => {
                src.remove(i - 1);
                i -= 1;
                j -= 1;
            }
            std::cmp::Ordering::Greater => i -= 1,
            std::cmp::Ordering::Less => j -= 1,
        }
    }
    src
}

async fn run_registry(ctx: &Ctx, step: &SyncStep, action: Action) -> Result<usize> {
    let (src, tgt) = step_refs(step)?;

    let mut repos: Vec<String> = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = ctx.client.repo_list(&src, cursor.as_deref()).await?;
        if page.is_empty() {
            break;
        }
        let page_last = page.last().cloned();
        // a server replaying the same page would loop us forever
        if page_last == cursor {
            debug!("repo listing cursor did not advance, stopping");
            break;
        }
        repos.extend(page);
        cursor = page_last;
    }
    repos.dedup();
    let repos = filter::filter_list(&step.repos, &repos)?;
    info!(
        "syncing registry source={} repositories={}",
        src.common_name(),
        repos.len()
    );

    let mut errs = Vec::new();
    let mut copied = 0usize;
    for repo in &repos {
        if ctx.cancel.is_cancelled() {
            errs.push(Error::Canceled);
            break;
        }
        let src_repo = src.with_repository(repo);
        let tgt_repo = tgt.with_repository(repo);
        match run_repository(ctx, step, action, src_repo, tgt_repo).await {
            Ok(n) => copied += n,
            Err(e) => {
                let canceled = e.is_canceled();
                errs.push(e);
                if ctx.abort_on_error && !canceled {
                    ctx.cancel.cancel();
                    break;
                }
            }
        }
    }
    Error::join(errs)?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_prune_existing() {
        assert_eq!(
            prune_existing(strs(&["v1", "v2", "v3"]), &strs(&["v1", "v3"])),
            strs(&["v2"])
        );
        assert_eq!(
            prune_existing(strs(&["v1", "v2"]), &strs(&[])),
            strs(&["v1", "v2"])
        );
        assert_eq!(prune_existing(strs(&[]), &strs(&["v1"])), strs(&[]));
        assert_eq!(
            prune_existing(strs(&["a", "b", "z"]), &strs(&["b", "c", "x", "z"])),
            strs(&["a"])
        );
        // everything already present
        assert_eq!(
            prune_existing(strs(&["a", "b"]), &strs(&["a", "b"])),
            strs(&[] as &[&str])
        );
    }
}
