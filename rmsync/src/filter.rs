use std::collections::HashSet;

use regex::Regex;

use rmoci::error::{Error, Result};

use crate::config::AllowDeny;

/// Allow list first, then deny list. Patterns are anchored implicitly; an
/// empty allow list passes everything. Result keeps input order with
/// duplicates removed. A bad pattern fails the whole step.
pub fn filter_list(ad: &AllowDeny, input: &[String]) -> Result<Vec<String>> {
    let allow = compile(&ad.allow)?;
    let deny = compile(&ad.deny)?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for name in input {
        if !allow.is_empty() && !allow.iter().any(|re| re.is_match(name)) {
            continue;
        }
        if deny.iter().any(|re| re.is_match(name)) {
            continue;
        }
        if seen.insert(name.clone()) {
            out.push(name.clone());
        }
    }
    Ok(out)
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{p})$"))
                .map_err(|e| Error::InvalidInput(format!("bad filter pattern {p}: {e}")))
        })
        .collect()
}

/// First cleanup-exclusion pattern matching the tag, if any. These patterns
/// are used as written, without implicit anchoring.
pub fn cleanup_exclusion<'a>(tag: &str, patterns: &'a [String]) -> Result<Option<&'a str>> {
    for p in patterns {
        let re = Regex::new(p)
            .map_err(|e| Error::InvalidInput(format!("bad exclusion pattern {p}: {e}")))?;
        if re.is_match(tag) {
            return Ok(Some(p));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_allow_then_deny() {
        let ad = AllowDeny {
            allow: strs(&["v.*", "latest"]),
            deny: strs(&["v2"]),
        };
        let input = strs(&["v1", "v2", "v3", "latest", "nightly"]);
        assert_eq!(filter_list(&ad, &input).unwrap(), strs(&["v1", "v3", "latest"]));
    }

    #[test]
    fn test_empty_allow_passes_all() {
        let ad = AllowDeny::default();
        let input = strs(&["a", "b"]);
        assert_eq!(filter_list(&ad, &input).unwrap(), input);
    }

    #[test]
    fn test_patterns_are_anchored() {
        let ad = AllowDeny {
            allow: strs(&["v1"]),
            deny: vec![],
        };
        let input = strs(&["v1", "v11", "av1"]);
        assert_eq!(filter_list(&ad, &input).unwrap(), strs(&["v1"]));
    }

    #[test]
    fn test_idempotent_and_dedup() {
        let ad = AllowDeny {
            allow: strs(&["v.*"]),
            deny: strs(&["v9"]),
        };
        let input = strs(&["v2", "v1", "v2", "v9"]);
        let once = filter_list(&ad, &input).unwrap();
        assert_eq!(once, strs(&["v2", "v1"]));
        let twice = filter_list(&ad, &once).unwrap();
        assert_eq!(twice, once);
    }

    #[test]
    fn test_empty_input() {
        let ad = AllowDeny {
            allow: strs(&["v.*"]),
            deny: vec![],
        };
        assert!(filter_list(&ad, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_bad_regex() {
        let ad = AllowDeny {
            allow: strs(&["v["]),
            deny: vec![],
        };
        assert!(matches!(
            filter_list(&ad, &strs(&["v1"])),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_cleanup_exclusion() {
        let patterns = strs(&["^keep-.*$", "^pinned$"]);
        assert_eq!(
            cleanup_exclusion("keep-me", &patterns).unwrap(),
            Some("^keep-.*$")
        );
        assert_eq!(cleanup_exclusion("pinned", &patterns).unwrap(), Some("^pinned$"));
        assert_eq!(cleanup_exclusion("v2", &patterns).unwrap(), None);
        assert_eq!(cleanup_exclusion("v2", &[]).unwrap(), None);
    }
}
