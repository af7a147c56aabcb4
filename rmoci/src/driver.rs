use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use oci_spec::image::{Descriptor, Digest, DigestAlgorithm};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::ocidir::OciDir;
use crate::reference::{Reference, Scheme};
use crate::regdist::RegClient;

/// Blob contents in flight. Both drivers produce and consume this shape.
pub type BlobStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + 'static>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub remaining: u64,
    pub window: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct ReferrerFilter {
    pub artifact_type: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl ReferrerFilter {
    pub fn matches(&self, d: &Descriptor) -> bool {
        if let Some(want) = &self.artifact_type {
            let got = d.artifact_type().as_ref().map(|mt| mt.to_string());
            if got.as_deref() != Some(want.as_str()) {
                return false;
            }
        }
        for (k, want) in &self.annotations {
            let got = d.annotations().as_ref().and_then(|a| a.get(k));
            if got.map(|v| v.as_str()) != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}

/// A referrer passes when any filter accepts it; no filters accept all.
pub fn referrer_matches(filters: &[ReferrerFilter], d: &Descriptor) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.matches(d))
}

/// The registry read/write contract, implemented by the remote driver and
/// the on-disk layout store. References passed in are fully specified for
/// the backend in question.
#[async_trait]
pub trait RegistryDriver: Send + Sync {
    async fn manifest_head(&self, r: &Reference) -> Result<Descriptor>;
    async fn manifest_get(&self, r: &Reference) -> Result<Manifest>;
    async fn manifest_put(&self, r: &Reference, m: &Manifest, child: bool) -> Result<()>;
    async fn manifest_delete(&self, r: &Reference) -> Result<()>;
    async fn blob_head(&self, r: &Reference, d: &Descriptor) -> Result<Descriptor>;
    async fn blob_get(&self, r: &Reference, d: &Descriptor) -> Result<BlobStream>;
    async fn blob_put(
        &self,
        r: &Reference,
        d: Option<&Descriptor>,
        stream: BlobStream,
    ) -> Result<Descriptor>;
    async fn blob_delete(&self, r: &Reference, d: &Descriptor) -> Result<()>;
    async fn tag_list(&self, r: &Reference) -> Result<Vec<String>>;
    async fn tag_delete(&self, r: &Reference) -> Result<()>;
    async fn repo_list(&self, r: &Reference, last: Option<&str>) -> Result<Vec<String>>;
    async fn referrer_list(
        &self,
        r: &Reference,
        filters: &[ReferrerFilter],
    ) -> Result<Vec<Descriptor>>;
    async fn rate_limit(&self, r: &Reference) -> Option<RateLimit>;
    async fn ping(&self, r: &Reference) -> Result<()>;
    async fn close(&self, r: &Reference) -> Result<()>;
}

/// Wraps a stream with a running sha256 and byte count, verified when the
/// inner stream ends. A short body surfaces as `ShortRead`, a long one as
/// `SizeMismatch`, a digest difference as `DigestMismatch`. Algorithms we
/// do not compute pass through with the size check only.
pub struct DigestStream {
    inner: BlobStream,
    hasher: Option<Sha256>,
    expected: Option<Digest>,
    expected_size: u64,
    seen: u64,
    done: bool,
}

impl DigestStream {
    pub fn new(inner: BlobStream, expected: Option<&Digest>, expected_size: u64) -> DigestStream {
        let verify_sha256 = matches!(
            expected.map(|d| d.algorithm().clone()),
            Some(DigestAlgorithm::Sha256)
        );
        DigestStream {
            inner,
            hasher: verify_sha256.then(Sha256::new),
            expected: expected.cloned(),
            expected_size,
            seen: 0,
            done: false,
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.expected_size > 0 && self.seen != self.expected_size {
            if self.seen < self.expected_size {
                return Err(Error::ShortRead);
            }
            return Err(Error::SizeMismatch);
        }
        if let (Some(hasher), Some(expected)) = (self.hasher.take(), &self.expected) {
            if hex::encode(hasher.finalize()) != expected.digest() {
                return Err(Error::DigestMismatch);
            }
        }
        Ok(())
    }
}

impl Stream for DigestStream {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.seen += chunk.len() as u64;
                if let Some(hasher) = this.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                match this.finish() {
                    Ok(()) => Poll::Ready(None),
                    Err(e) => Poll::Ready(Some(Err(e))),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Fail a transfer with `SizeLimitExceeded` once more than `limit` bytes
/// have been seen. Zero means unlimited.
pub fn with_limit(inner: BlobStream, limit: u64) -> BlobStream {
    if limit == 0 {
        return inner;
    }
    let mut seen: u64 = 0;
    inner
        .map(move |chunk| {
            let chunk = chunk?;
            seen += chunk.len() as u64;
            if seen > limit {
                return Err(Error::SizeLimitExceeded(limit));
            }
            Ok(chunk)
        })
        .boxed()
}

pub fn bytes_stream(b: Bytes) -> BlobStream {
    futures::stream::once(async move { Ok(b) }).boxed()
}

pub async fn stream_to_bytes(s: BlobStream) -> Result<Bytes> {
    let chunks: Vec<Bytes> = s.try_collect().await?;
    let mut out = Vec::with_capacity(chunks.iter().map(|c| c.len()).sum());
    for c in chunks {
        out.extend_from_slice(&c);
    }
    Ok(Bytes::from(out))
}

/// Scheme-dispatching front end over the drivers. Layout stores are created
/// on first use and kept for the life of the client so mutation tracking
/// and GC happen once per path.
pub struct Client {
    reg: Arc<RegClient>,
    dirs: tokio::sync::Mutex<HashMap<String, Arc<OciDir>>>,
    gc: bool,
}

impl Client {
    pub fn new(reg: RegClient) -> Client {
        Client {
            reg: Arc::new(reg),
            dirs: tokio::sync::Mutex::new(HashMap::new()),
            gc: true,
        }
    }

    pub fn with_gc(mut self, gc: bool) -> Client {
        self.gc = gc;
        self
    }

    pub async fn driver_for(&self, r: &Reference) -> Result<Arc<dyn RegistryDriver>> {
        match r.scheme {
            Scheme::Reg => Ok(self.reg.clone() as Arc<dyn RegistryDriver>),
            Scheme::OciDir => {
                let mut dirs = self.dirs.lock().await;
                let dir = dirs
                    .entry(r.path.clone())
                    .or_insert_with(|| Arc::new(OciDir::new(&r.path, self.gc)))
                    .clone();
                Ok(dir as Arc<dyn RegistryDriver>)
            }
            Scheme::OciFile => Err(Error::NotImplemented("ocifile store")),
        }
    }

    pub async fn manifest_head(&self, r: &Reference) -> Result<Descriptor> {
        self.driver_for(r).await?.manifest_head(r).await
    }

    pub async fn manifest_get(&self, r: &Reference) -> Result<Manifest> {
        self.driver_for(r).await?.manifest_get(r).await
    }

    pub async fn manifest_put(&self, r: &Reference, m: &Manifest, child: bool) -> Result<()> {
        self.driver_for(r).await?.manifest_put(r, m, child).await
    }

    pub async fn manifest_delete(&self, r: &Reference) -> Result<()> {
        self.driver_for(r).await?.manifest_delete(r).await
    }

    pub async fn blob_head(&self, r: &Reference, d: &Descriptor) -> Result<Descriptor> {
        self.driver_for(r).await?.blob_head(r, d).await
    }

    pub async fn blob_get(&self, r: &Reference, d: &Descriptor) -> Result<BlobStream> {
        self.driver_for(r).await?.blob_get(r, d).await
    }

    pub async fn blob_put(
        &self,
        r: &Reference,
        d: Option<&Descriptor>,
        stream: BlobStream,
    ) -> Result<Descriptor> {
        self.driver_for(r).await?.blob_put(r, d, stream).await
    }

    pub async fn blob_delete(&self, r: &Reference, d: &Descriptor) -> Result<()> {
        self.driver_for(r).await?.blob_delete(r, d).await
    }

    pub async fn tag_list(&self, r: &Reference) -> Result<Vec<String>> {
        self.driver_for(r).await?.tag_list(r).await
    }

    pub async fn tag_delete(&self, r: &Reference) -> Result<()> {
        self.driver_for(r).await?.tag_delete(r).await
    }

    pub async fn repo_list(&self, r: &Reference, last: Option<&str>) -> Result<Vec<String>> {
        self.driver_for(r).await?.repo_list(r, last).await
    }

    pub async fn referrer_list(
        &self,
        r: &Reference,
        filters: &[ReferrerFilter],
    ) -> Result<Vec<Descriptor>> {
        self.driver_for(r).await?.referrer_list(r, filters).await
    }

    pub async fn rate_limit(&self, r: &Reference) -> Option<RateLimit> {
        self.driver_for(r).await.ok()?.rate_limit(r).await
    }

    pub async fn ping(&self, r: &Reference) -> Result<()> {
        self.driver_for(r).await?.ping(r).await
    }

    pub async fn close(&self, r: &Reference) -> Result<()> {
        self.driver_for(r).await?.close(r).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest;

    #[tokio::test]
    async fn test_digest_stream_ok() {
        let data = Bytes::from_static(b"hello blob");
        let d = digest::from_data(&data);
        let s = DigestStream::new(bytes_stream(data.clone()), Some(&d), data.len() as u64);
        let out = stream_to_bytes(Box::pin(s)).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_digest_stream_mismatch() {
        let data = Bytes::from_static(b"hello blob");
        let d = digest::from_data("other data");
        let s = DigestStream::new(bytes_stream(data.clone()), Some(&d), data.len() as u64);
        assert!(matches!(
            stream_to_bytes(Box::pin(s)).await,
            Err(Error::DigestMismatch)
        ));
    }

    #[tokio::test]
    async fn test_digest_stream_short() {
        let data = Bytes::from_static(b"hello blob");
        let d = digest::from_data(&data);
        let s = DigestStream::new(bytes_stream(data.clone()), Some(&d), data.len() as u64 + 1);
        assert!(matches!(
            stream_to_bytes(Box::pin(s)).await,
            Err(Error::ShortRead)
        ));
    }

    #[tokio::test]
    async fn test_limit() {
        let data = Bytes::from_static(b"hello blob");
        let s = with_limit(bytes_stream(data.clone()), 4);
        assert!(matches!(
            stream_to_bytes(s).await,
            Err(Error::SizeLimitExceeded(4))
        ));
        let s = with_limit(bytes_stream(data.clone()), 1000);
        assert_eq!(stream_to_bytes(s).await.unwrap(), data);
    }

    #[test]
    fn test_referrer_filter() {
        let m = Manifest::from_bytes(
            Some(crate::manifest::MT_OCI_MANIFEST),
            Bytes::from_static(
                br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","artifactType":"application/example.sbom","config":{"mediaType":"application/vnd.oci.empty.v1+json","digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a","size":2},"layers":[]}"#,
            ),
        )
        .unwrap();
        let d = m.referrer_descriptor().unwrap();

        let sbom = ReferrerFilter {
            artifact_type: Some("application/example.sbom".into()),
            ..Default::default()
        };
        let sig = ReferrerFilter {
            artifact_type: Some("application/example.signature".into()),
            ..Default::default()
        };
        assert!(referrer_matches(&[], &d));
        assert!(referrer_matches(&[sbom.clone()], &d));
        assert!(!referrer_matches(&[sig.clone()], &d));
        assert!(referrer_matches(&[sig, sbom], &d));
    }
}
