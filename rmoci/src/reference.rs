use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::digest;
use crate::error::{Error, Result};

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").unwrap());

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Reg,
    OciDir,
    OciFile,
}

/// A structured image name. At most one of tag/digest is active for a given
/// operation; when both are present the digest wins for reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Reference {
    pub scheme: Scheme,
    pub registry: String,
    pub repository: String,
    pub path: String,
    pub tag: String,
    pub digest: String,
}

const DEFAULT_REGISTRY: &str = "docker.io";

impl Reference {
    pub fn parse(s: &str) -> Result<Reference> {
        if s.is_empty() {
            return Err(Error::InvalidReference("empty reference".into()));
        }
        if let Some(rest) = s.strip_prefix("ocidir://") {
            return Self::parse_path(Scheme::OciDir, rest);
        }
        if let Some(rest) = s.strip_prefix("ocifile://") {
            return Self::parse_path(Scheme::OciFile, rest);
        }

        let (rest, dig) = split_digest(s)?;
        // a bare host is a registry-scope reference, not a repository
        if !rest.contains('/') && (rest.contains('.') || rest.starts_with("localhost")) {
            return Ok(Reference {
                scheme: Scheme::Reg,
                registry: rest.to_string(),
                repository: String::new(),
                path: String::new(),
                tag: String::new(),
                digest: dig,
            });
        }
        let (registry, repo) = match rest.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), remainder)
            }
            _ => (DEFAULT_REGISTRY.to_string(), rest),
        };
        let (repo, tag) = split_tag(repo)?;
        if repo.is_empty() {
            return Err(Error::InvalidReference(format!("no repository in {s}")));
        }
        if repo.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(Error::InvalidReference(format!(
                "repository must be lowercase in {s}"
            )));
        }
        Ok(Reference {
            scheme: Scheme::Reg,
            registry,
            repository: repo.to_string(),
            path: String::new(),
            tag,
            digest: dig,
        })
    }

    fn parse_path(scheme: Scheme, rest: &str) -> Result<Reference> {
        let (rest, dig) = split_digest(rest)?;
        let (path, tag) = split_tag(rest)?;
        if path.is_empty() {
            return Err(Error::InvalidReference(format!("no path in {scheme:?} reference")));
        }
        Ok(Reference {
            scheme,
            registry: String::new(),
            repository: String::new(),
            path: path.to_string(),
            tag,
            digest: dig,
        })
    }

    /// The canonical rendering; `parse(common_name(r)) == r`.
    pub fn common_name(&self) -> String {
        let mut s = match self.scheme {
            Scheme::Reg => {
                if self.repository.is_empty() {
                    self.registry.clone()
                } else if self.registry.is_empty() {
                    self.repository.clone()
                } else {
                    format!("{}/{}", self.registry, self.repository)
                }
            }
            Scheme::OciDir => format!("ocidir://{}", self.path),
            Scheme::OciFile => format!("ocifile://{}", self.path),
        };
        if !self.tag.is_empty() {
            s.push(':');
            s.push_str(&self.tag);
        }
        if !self.digest.is_empty() {
            s.push('@');
            s.push_str(&self.digest);
        }
        s
    }

    pub fn with_tag(&self, tag: &str) -> Result<Reference> {
        if !TAG_RE.is_match(tag) {
            return Err(Error::InvalidReference(format!("bad tag {tag}")));
        }
        let mut r = self.clone();
        r.tag = tag.to_string();
        r.digest = String::new();
        Ok(r)
    }

    pub fn with_digest(&self, dig: &str) -> Result<Reference> {
        digest::validate(dig)?;
        let mut r = self.clone();
        r.tag = String::new();
        r.digest = dig.to_string();
        Ok(r)
    }

    pub fn with_repository(&self, repo: &str) -> Reference {
        let mut r = self.clone();
        match self.scheme {
            Scheme::Reg => r.repository = repo.to_string(),
            _ => r.path = format!("{}/{}", self.path, repo),
        }
        r.tag = String::new();
        r.digest = String::new();
        r
    }
}

fn split_digest(s: &str) -> Result<(&str, String)> {
    match s.split_once('@') {
        Some((rest, d)) => {
            digest::validate(d)?;
            Ok((rest, d.to_string()))
        }
        None => Ok((s, String::new())),
    }
}

// the tag separator is the last ':' not part of a host:port or a path
fn split_tag(s: &str) -> Result<(&str, String)> {
    match s.rsplit_once(':') {
        Some((rest, t)) if !t.contains('/') => {
            if !TAG_RE.is_match(t) {
                return Err(Error::InvalidReference(format!("bad tag {t}")));
            }
            Ok((rest, t.to_string()))
        }
        _ => Ok((s, String::new())),
    }
}

impl std::str::FromStr for Reference {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.common_name())
    }
}
