use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use rmoci::ReferrerFilter;
use rmoci::error::{Error, Result};
use rmoci::manifest::DEFAULT_MEDIA_TYPES;

pub const RATE_LIMIT_RETRY_MIN: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// The sync configuration document. Loaded from YAML, then `finalize`
/// folds defaults into each step and applies the coercions, so the engine
/// only ever sees resolved steps.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub version: i64,
    pub creds: Vec<CredHost>,
    pub defaults: Defaults,
    pub sync: Vec<SyncStep>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredHost {
    pub registry: String,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub tls: Option<TlsSetting>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TlsSetting {
    Enabled,
    Insecure,
    Disabled,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitCfg {
    pub min: u64,
    #[serde(with = "opt_duration")]
    pub retry: Option<Duration>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Hooks {
    pub pre: Option<String>,
    pub post: Option<String>,
    pub unchanged: Option<String>,
}

impl Hooks {
    pub fn is_empty(&self) -> bool {
        self.pre.is_none() && self.post.is_none() && self.unchanged.is_none()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllowDeny {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReferrerFilterCfg {
    pub artifact_type: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl From<&ReferrerFilterCfg> for ReferrerFilter {
    fn from(cfg: &ReferrerFilterCfg) -> ReferrerFilter {
        ReferrerFilter {
            artifact_type: cfg.artifact_type.clone(),
            annotations: cfg.annotations.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Defaults {
    pub parallel: Option<i64>,
    #[serde(with = "opt_duration")]
    pub interval: Option<Duration>,
    pub schedule: Option<String>,
    pub rate_limit: Option<RateLimitCfg>,
    pub media_types: Option<Vec<String>>,
    pub backup: Option<String>,
    pub cache_count: Option<u64>,
    #[serde(with = "opt_duration")]
    pub cache_time: Option<Duration>,
    pub blob_limit: Option<u64>,
    pub user_agent: Option<String>,
    pub skip_docker_config: Option<bool>,
    pub hooks: Hooks,
    pub referrers: Option<bool>,
    pub referrer_filters: Vec<ReferrerFilterCfg>,
    pub digest_tags: Option<bool>,
    pub fast_check: Option<bool>,
    pub force_recursive: Option<bool>,
    pub include_external: Option<bool>,
    pub platform: Option<String>,
    pub platforms: Vec<String>,
    pub cleanup_tags_exclude: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepScope {
    #[default]
    Image,
    Repository,
    Registry,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncStep {
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub scope: StepScope,
    pub tags: AllowDeny,
    pub repos: AllowDeny,
    pub platform: Option<String>,
    pub platforms: Vec<String>,
    pub referrers: Option<bool>,
    pub referrer_filters: Vec<ReferrerFilterCfg>,
    pub referrer_source: Option<String>,
    pub referrer_target: Option<String>,
    pub digest_tags: Option<bool>,
    pub fast_check: Option<bool>,
    pub force_recursive: Option<bool>,
    pub include_external: Option<bool>,
    pub media_types: Option<Vec<String>>,
    pub backup: Option<String>,
    pub rate_limit: Option<RateLimitCfg>,
    #[serde(with = "opt_duration")]
    pub interval: Option<Duration>,
    pub schedule: Option<String>,
    pub blob_limit: Option<u64>,
    pub cleanup: Option<bool>,
    pub cleanup_tags_exclude: Vec<String>,
    pub tag_sets: Vec<AllowDeny>,
    pub hooks: Option<Hooks>,
}

impl Config {
    pub fn load(reader: impl std::io::Read) -> Result<Config> {
        let mut cfg: Config = serde_yaml::from_reader(reader)
            .map_err(|e| Error::ParseError(format!("config: {e}")))?;
        cfg.finalize()?;
        Ok(cfg)
    }

    /// Validate and fold defaults into the steps.
    pub fn finalize(&mut self) -> Result<()> {
        if self.version > 1 {
            return Err(Error::UnsupportedConfigVersion(self.version));
        }
        for step in &mut self.sync {
            if step.source.is_empty() {
                return Err(Error::MissingInput("sync step without a source".into()));
            }
            if step.target.is_empty() {
                return Err(Error::MissingInput("sync step without a target".into()));
            }
            let d = &self.defaults;
            merge(&mut step.referrers, &d.referrers);
            merge(&mut step.digest_tags, &d.digest_tags);
            merge(&mut step.fast_check, &d.fast_check);
            merge(&mut step.force_recursive, &d.force_recursive);
            merge(&mut step.include_external, &d.include_external);
            merge(&mut step.platform, &d.platform);
            merge(&mut step.backup, &d.backup);
            merge(&mut step.blob_limit, &d.blob_limit);
            merge(&mut step.media_types, &d.media_types);
            merge(&mut step.interval, &d.interval);
            merge(&mut step.schedule, &d.schedule);
            merge(&mut step.rate_limit, &d.rate_limit);
            if step.platforms.is_empty() {
                step.platforms = d.platforms.clone();
            }
            if step.referrer_filters.is_empty() {
                step.referrer_filters = d.referrer_filters.clone();
            }
            if step.cleanup_tags_exclude.is_empty() {
                step.cleanup_tags_exclude = d.cleanup_tags_exclude.clone();
            }
            if step.hooks.is_none() && !d.hooks.is_empty() {
                step.hooks = Some(d.hooks.clone());
            }
            if step.media_types.as_ref().map(|m| m.is_empty()).unwrap_or(true) {
                step.media_types =
                    Some(DEFAULT_MEDIA_TYPES.iter().map(|s| s.to_string()).collect());
            }
            if let Some(rl) = &mut step.rate_limit {
                if rl.min > 0 {
                    let retry = rl.retry.unwrap_or(RATE_LIMIT_RETRY_MIN);
                    rl.retry = Some(retry.max(RATE_LIMIT_RETRY_MIN));
                }
            }
            // a step in server mode always has something to go on
            if step.schedule.is_none() && step.interval.is_none() {
                step.interval = Some(DEFAULT_INTERVAL);
            }
        }
        Ok(())
    }

    /// Worker count for the scheduler; at least one.
    pub fn parallel(&self) -> usize {
        self.defaults.parallel.map(|p| p.max(1)).unwrap_or(1) as usize
    }

    /// An explicit `parallel: 0` (or lower) keeps the legacy behavior of
    /// running cron handlers on the scheduling task.
    pub fn sequential(&self) -> bool {
        matches!(self.defaults.parallel, Some(p) if p <= 0)
    }
}

impl SyncStep {
    pub fn rate_limit_min(&self) -> u64 {
        self.rate_limit.as_ref().map(|rl| rl.min).unwrap_or(0)
    }

    pub fn rate_limit_retry(&self) -> Duration {
        self.rate_limit
            .as_ref()
            .and_then(|rl| rl.retry)
            .unwrap_or(RATE_LIMIT_RETRY_MIN)
            .max(RATE_LIMIT_RETRY_MIN)
    }

    pub fn media_type_allowed(&self, mt: &str) -> bool {
        self.media_types
            .as_ref()
            .map(|list| list.iter().any(|m| m == mt))
            .unwrap_or(true)
    }
}

fn merge<T: Clone>(step: &mut Option<T>, default: &Option<T>) {
    if step.is_none() {
        *step = default.clone();
    }
}

/// `"300"`, `"45s"`, `"15m"`, `"2h"`, and combinations like `"1h30m"`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidInput("empty duration".into()));
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    let mut total = 0u64;
    let mut num = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            num.push(c);
            continue;
        }
        let n: u64 = num
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad duration {s}")))?;
        num.clear();
        total += match c {
            's' => n,
            'm' => n * 60,
            'h' => n * 3600,
            'd' => n * 86400,
            _ => return Err(Error::InvalidInput(format!("bad duration unit in {s}"))),
        };
    }
    if !num.is_empty() {
        return Err(Error::InvalidInput(format!("bad duration {s}")));
    }
    Ok(Duration::from_secs(total))
}

pub fn render_duration(d: &Duration) -> String {
    let secs = d.as_secs();
    if secs > 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

mod opt_duration {
    use super::{parse_duration, render_duration};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        v.as_ref().map(render_duration).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<Raw> = Option::deserialize(d)?;
        match raw {
            None => Ok(None),
            Some(Raw::Secs(n)) => Ok(Some(Duration::from_secs(n))),
            Some(Raw::Text(s)) => parse_duration(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 1
creds:
  - registry: registry.example.org
    user: syncer
    pass: hunter2
defaults:
  parallel: 2
  interval: 60m
  rateLimit:
    min: 100
    retry: 30s
  backup: "backup-{{ Ref.Tag }}"
sync:
  - source: ocidir://upstream
    target: ocidir://mirror
    type: repository
    tags:
      allow: ["v1", "v3", "latest"]
  - source: registry.example.org/app
    target: localhost:5000/app
    type: image
    schedule: "15 3 * * *"
    rateLimit:
      min: 10
      retry: 20m
"#;

    #[test]
    fn test_load_sample() {
        let cfg = Config::load(SAMPLE.as_bytes()).unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.creds.len(), 1);
        assert_eq!(cfg.sync.len(), 2);
        assert_eq!(cfg.parallel(), 2);
        assert!(!cfg.sequential());

        let s0 = &cfg.sync[0];
        assert_eq!(s0.scope, StepScope::Repository);
        assert_eq!(s0.tags.allow, vec!["v1", "v3", "latest"]);
        // defaults folded in
        assert_eq!(s0.backup.as_deref(), Some("backup-{{ Ref.Tag }}"));
        assert_eq!(s0.interval, Some(Duration::from_secs(3600)));
        // retry below the floor is raised to it
        assert_eq!(s0.rate_limit_retry(), RATE_LIMIT_RETRY_MIN);
        // empty mediaTypes gets the canonical four
        assert_eq!(s0.media_types.as_ref().unwrap().len(), 4);

        let s1 = &cfg.sync[1];
        assert_eq!(s1.schedule.as_deref(), Some("15 3 * * *"));
        assert_eq!(s1.rate_limit_retry(), Duration::from_secs(20 * 60));
        assert_eq!(s1.rate_limit_min(), 10);
    }

    #[test]
    fn test_version_rejected() {
        let res = Config::load("version: 2\nsync: []\n".as_bytes());
        assert!(matches!(res, Err(Error::UnsupportedConfigVersion(2))));
    }

    #[test]
    fn test_parallel_coercion() {
        let cfg = Config::load("defaults:\n  parallel: -3\nsync: []\n".as_bytes()).unwrap();
        assert_eq!(cfg.parallel(), 1);
        assert!(cfg.sequential());
        let cfg = Config::load("sync: []\n".as_bytes()).unwrap();
        assert_eq!(cfg.parallel(), 1);
        assert!(!cfg.sequential());
    }

    #[test]
    fn test_missing_source_rejected() {
        let res = Config::load("sync:\n  - target: ocidir://x\n".as_bytes());
        assert!(matches!(res, Err(Error::MissingInput(_))));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("h").is_err());
    }

    #[test]
    fn test_render_duration() {
        assert_eq!(render_duration(&Duration::from_secs(3600)), "1h");
        assert_eq!(render_duration(&Duration::from_secs(900)), "15m");
        assert_eq!(render_duration(&Duration::from_secs(45)), "45s");
    }
}
