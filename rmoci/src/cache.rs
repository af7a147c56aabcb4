use std::time::Duration;

use moka::future::Cache;

use crate::manifest::Manifest;

/// Process-wide digest to manifest map, shared by every reconciliation so
/// that resolving a platform inside an index only fetches the index once.
/// Purely an optimization; nothing may rely on a hit.
#[derive(Clone)]
pub struct ManifestCache {
    cache: Cache<String, Manifest>,
}

impl ManifestCache {
    pub fn new(count: u64, time: Option<Duration>) -> ManifestCache {
        let mut builder = Cache::builder().max_capacity(count.max(1));
        if let Some(ttl) = time {
            builder = builder.time_to_live(ttl);
        }
        ManifestCache {
            cache: builder.build(),
        }
    }

    pub async fn get(&self, digest: &str) -> Option<Manifest> {
        self.cache.get(digest).await
    }

    pub async fn insert(&self, m: &Manifest) {
        self.cache.insert(m.digest().to_string(), m.clone()).await;
    }
}

impl Default for ManifestCache {
    fn default() -> ManifestCache {
        ManifestCache::new(500, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_round_trip() {
        let raw = Bytes::from_static(
            br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.index.v1+json","manifests":[]}"#,
        );
        let m = Manifest::from_bytes(Some(manifest::MT_OCI_INDEX), raw).unwrap();
        let cache = ManifestCache::default();
        assert!(cache.get(&m.digest().to_string()).await.is_none());
        cache.insert(&m).await;
        let hit = cache.get(&m.digest().to_string()).await.unwrap();
        assert_eq!(hit.raw(), m.raw());
    }
}
