use std::collections::HashSet;

use log::{debug, info};

use rmoci::Reference;
use rmoci::error::{Error, Result};

use crate::config::SyncStep;
use crate::filter;
use crate::sync::Ctx;

/// Delete target tags that no filter wants, honoring the exclusion list.
/// The wanted set is the union of the step's tag filter and every entry in
/// `tagSets`, all applied to the target's current tags.
pub async fn run(ctx: &Ctx, step: &SyncStep, tgt: &Reference) -> Result<()> {
    let tags = ctx.client.tag_list(tgt).await?;

    let mut wanted: HashSet<String> = filter::filter_list(&step.tags, &tags)?.into_iter().collect();
    for set in &step.tag_sets {
        wanted.extend(filter::filter_list(set, &tags)?);
    }

    let mut errs = Vec::new();
    for tag in &tags {
        if wanted.contains(tag) {
            continue;
        }
        if ctx.cancel.is_cancelled() {
            errs.push(Error::Canceled);
            break;
        }
        match filter::cleanup_exclusion(tag, &step.cleanup_tags_exclude)? {
            Some(pattern) => {
                debug!("tag excluded from cleanup tag={tag} pattern={pattern}");
            }
            None => match ctx.client.tag_delete(&tgt.with_tag(tag)?).await {
                Ok(()) => info!("deleted unwanted tag target={} tag={tag}", tgt.common_name()),
                Err(e) => errs.push(e),
            },
        }
    }
    Error::join(errs)
}
