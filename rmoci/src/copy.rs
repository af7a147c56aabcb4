use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use log::{debug, error, info};
use oci_spec::image::Descriptor;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::driver::{Client, ReferrerFilter, with_limit};
use crate::error::{Error, Result};
use crate::manifest::platform_string;
use crate::ocidir::fallback_tag_str;
use crate::reference::Reference;

#[derive(Clone, Debug, Default)]
pub struct CopyOpts {
    pub platforms: Vec<String>,
    pub referrers: bool,
    pub referrer_filters: Vec<ReferrerFilter>,
    pub referrer_src: Option<Reference>,
    pub referrer_tgt: Option<Reference>,
    pub digest_tags: bool,
    pub force_recursive: bool,
    pub include_external: bool,
    pub blob_limit: u64,
}

/// Copy the manifest tree at `src` to `tgt`: blobs, index children, the
/// manifest itself, then referrers and digest-tagged sidecars when asked.
/// Already-present content is skipped by digest. The reconciler treats this
/// as one atomic operation.
pub async fn image_copy(
    client: &Arc<Client>,
    src: &Reference,
    tgt: &Reference,
    opts: &CopyOpts,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut seen = HashSet::new();
    copy_manifest(client, src.clone(), tgt.clone(), opts, cancel, &mut seen, false).await
}

// manifests may refer to each other through subject chains, so recursion
// carries the set of digests already handled
fn copy_manifest<'a>(
    client: &'a Arc<Client>,
    src: Reference,
    tgt: Reference,
    opts: &'a CopyOpts,
    cancel: &'a CancellationToken,
    seen: &'a mut HashSet<String>,
    child: bool,
) -> BoxFuture<'a, Result<()>> {
    async move {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        let m = client.manifest_get(&src).await?;
        if !seen.insert(m.digest().to_string()) {
            debug!("already handled {}", m.digest());
            return Ok(());
        }

        let matched = match client.manifest_head(&tgt).await {
            Ok(d) => d.digest() == m.digest(),
            Err(_) => false,
        };
        if matched && !opts.force_recursive && (child || (!opts.referrers && !opts.digest_tags)) {
            debug!("{} already matches {}", tgt.common_name(), m.digest());
            return Ok(());
        }

        if m.is_list() {
            for child_desc in m.manifest_list()? {
                if !opts.platforms.is_empty() {
                    let keep = child_desc
                        .platform()
                        .as_ref()
                        .map(|p| opts.platforms.iter().any(|w| w == &platform_string(p)))
                        .unwrap_or(false);
                    if !keep {
                        debug!(
                            "skipping platform of {} not in filter",
                            child_desc.digest()
                        );
                        continue;
                    }
                }
                let child_src = src.with_digest(&child_desc.digest().to_string())?;
                let child_tgt = tgt.with_digest(&child_desc.digest().to_string())?;
                copy_manifest(client, child_src, child_tgt, opts, cancel, seen, true).await?;
            }
        } else if !matched {
            let mut descs: Vec<Descriptor> = Vec::new();
            if let Some(config) = m.config_descriptor() {
                descs.push(config.clone());
            }
            descs.extend(m.layers().unwrap_or_default().iter().cloned());

            let mut set = JoinSet::new();
            for d in descs {
                if d.urls().as_ref().map(|u| !u.is_empty()).unwrap_or(false)
                    && !opts.include_external
                {
                    debug!("skipping external layer {}", d.digest());
                    continue;
                }
                let client = client.clone();
                let src = src.clone();
                let tgt = tgt.clone();
                let limit = opts.blob_limit;
                set.spawn(async move { blob_copy(&client, &src, &tgt, &d, limit).await });
            }
            let mut errs = Vec::new();
            while let Some(next) = set.join_next().await {
                match next {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errs.push(e),
                    Err(e) if e.is_cancelled() => errs.push(Error::Canceled),
                    Err(e) => {
                        error!("blob copy task failed: {e:?}");
                        errs.push(Error::Canceled);
                    }
                }
            }
            Error::join(errs)?;
        }

        if !matched {
            client.manifest_put(&tgt, &m, child).await?;
            info!(
                "copied manifest source={} target={} digest={}",
                src.common_name(),
                tgt.common_name(),
                m.digest()
            );
        }

        if !child && opts.referrers {
            let ref_src = opts.referrer_src.as_ref().unwrap_or(&src);
            let ref_tgt = opts.referrer_tgt.as_ref().unwrap_or(&tgt);
            let subject = ref_src.with_digest(&m.digest().to_string())?;
            let referrers = client
                .referrer_list(&subject, &opts.referrer_filters)
                .await?;
            for rdesc in referrers {
                if cancel.is_cancelled() {
                    return Err(Error::Canceled);
                }
                let r_src = ref_src.with_digest(&rdesc.digest().to_string())?;
                let r_tgt = ref_tgt.with_digest(&rdesc.digest().to_string())?;
                copy_manifest(client, r_src, r_tgt, opts, cancel, seen, false).await?;
            }
        }

        if !child && opts.digest_tags {
            let prefix = format!("{}.", fallback_tag_str(&m.digest().to_string()));
            let tags = match client.tag_list(&src).await {
                Ok(tags) => tags,
                Err(Error::NotFound(_)) => Vec::new(),
                Err(e) => return Err(e),
            };
            for tag in tags.into_iter().filter(|t| t.starts_with(&prefix)) {
                if cancel.is_cancelled() {
                    return Err(Error::Canceled);
                }
                debug!("copying digest tag {tag}");
                let t_src = src.with_tag(&tag)?;
                let t_tgt = tgt.with_tag(&tag)?;
                copy_manifest(client, t_src, t_tgt, opts, cancel, seen, false).await?;
            }
        }

        Ok(())
    }
    .boxed()
}

async fn blob_copy(
    client: &Client,
    src: &Reference,
    tgt: &Reference,
    d: &Descriptor,
    limit: u64,
) -> Result<()> {
    if let Ok(existing) = client.blob_head(tgt, d).await {
        if d.size() == 0 || existing.size() == 0 || existing.size() == d.size() {
            debug!("blob {} already on target", d.digest());
            return Ok(());
        }
    }
    let stream = client.blob_get(src, d).await?;
    let stream = with_limit(stream, limit);
    client.blob_put(tgt, Some(d), stream).await?;
    debug!("copied blob {} ({} bytes)", d.digest(), d.size());
    Ok(())
}
