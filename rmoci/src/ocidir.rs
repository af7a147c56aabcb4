use std::collections::HashSet;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info, warn};
use oci_spec::image::{Descriptor, Digest, ImageIndex, ImageIndexBuilder, MediaType};
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::io::ReaderStream;

use crate::digest;
use crate::driver::{
    BlobStream, DigestStream, RateLimit, ReferrerFilter, RegistryDriver, referrer_matches,
};
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::reference::Reference;

pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";
const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_VERSION: &str = "1.0.0";
const INDEX_FILE: &str = "index.json";
// concurrent blob writers per store
const BLOB_WRITE_LIMIT: usize = 3;

#[derive(serde::Serialize, serde::Deserialize)]
struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// One on-disk OCI image layout, acting as the registry backend for a single
/// repository. Writers to the index are serialized by the store mutex;
/// readers go straight to the files, which are only ever replaced whole.
/// Any mutation marks the store dirty; `close` runs a mark-sweep over the
/// blob directory when it is.
pub struct OciDir {
    root: PathBuf,
    gc: bool,
    index_lock: Mutex<()>,
    dirty: AtomicBool,
    write_throttle: Arc<Semaphore>,
}

impl OciDir {
    pub fn new(path: impl AsRef<Path>, gc: bool) -> OciDir {
        OciDir {
            root: path.as_ref().to_path_buf(),
            gc,
            index_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            write_throttle: Arc::new(Semaphore::new(BLOB_WRITE_LIMIT)),
        }
    }

    fn blob_path(&self, d: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(d.algorithm().as_ref())
            .join(d.digest())
    }

    async fn read_index(&self) -> Result<ImageIndex> {
        let layout = tokio::fs::read(self.root.join(LAYOUT_FILE))
            .await
            .map_err(|_| Error::ParseError(format!("{:?} has no oci-layout", self.root)))?;
        let layout: OciLayout = serde_json::from_slice(&layout)
            .map_err(|e| Error::ParseError(format!("bad oci-layout: {e}")))?;
        if layout.image_layout_version != LAYOUT_VERSION {
            return Err(Error::ParseError(format!(
                "unsupported layout version {}",
                layout.image_layout_version
            )));
        }
        let raw = tokio::fs::read(self.root.join(INDEX_FILE))
            .await
            .map_err(|_| Error::ParseError(format!("{:?} has no index.json", self.root)))?;
        serde_json::from_slice(&raw).map_err(|e| Error::ParseError(format!("bad index.json: {e}")))
    }

    async fn read_index_or_empty(&self) -> Result<ImageIndex> {
        match tokio::fs::try_exists(self.root.join(LAYOUT_FILE)).await {
            Ok(true) => self.read_index().await,
            _ => empty_index(),
        }
    }

    // whole-file replacement; readers never see a partial index
    async fn write_index(&self, idx: &ImageIndex) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let layout = serde_json::to_vec(&OciLayout {
            image_layout_version: LAYOUT_VERSION.to_string(),
        })?;
        write_file_atomic(&self.root, LAYOUT_FILE, &layout)?;
        let raw = serde_json::to_vec(idx)?;
        write_file_atomic(&self.root, INDEX_FILE, &raw)?;
        Ok(())
    }

    /// Tag or digest to descriptor. An empty reference means tag `latest`.
    /// A digest not listed in the index still resolves when its blob file
    /// exists; the media type is sniffed from the content.
    async fn resolve(&self, idx: &ImageIndex, r: &Reference) -> Result<Descriptor> {
        if !r.digest.is_empty() {
            if let Some(d) = idx
                .manifests()
                .iter()
                .find(|d| d.digest().to_string() == r.digest)
            {
                return Ok(d.clone());
            }
            let raw = self.read_blob_by_digest(&r.digest).await?;
            let m = Manifest::from_bytes(None, raw)?;
            return Ok(m.descriptor().clone());
        }
        let tag = if r.tag.is_empty() { "latest" } else { &r.tag };
        idx.manifests()
            .iter()
            .find(|d| entry_tag(d) == Some(tag))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{}:{}", r.common_name(), tag)))
    }

    async fn read_blob_by_digest(&self, dig: &str) -> Result<Bytes> {
        digest::validate(dig)?;
        let (algo, hex) = dig.split_once(':').unwrap();
        let path = self.root.join("blobs").join(algo).join(hex);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Bytes::from(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::FileNotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_blob_bytes(&self, dig: &Digest, raw: &[u8]) -> Result<()> {
        let final_path = self.blob_path(dig);
        let dir = final_path.parent().expect("blob path has a parent");
        tokio::fs::create_dir_all(dir).await?;
        write_file_atomic(dir, dig.digest(), raw)?;
        Ok(())
    }

    /// Add or replace the index entry for a descriptor. With a tag the entry
    /// carries the `ref.name` annotation and replaces any entry holding that
    /// tag; untagged entries dedupe by digest.
    async fn upsert_entry(&self, desc: &Descriptor, tag: Option<&str>) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let idx = self.read_index_or_empty().await?;
        let mut manifests = idx.manifests().clone();
        let mut desc = desc.clone();
        match tag {
            Some(tag) => {
                manifests.retain(|d| entry_tag(d) != Some(tag));
                let mut annotations = desc.annotations().clone().unwrap_or_default();
                annotations.insert(REF_NAME_ANNOTATION.to_string(), tag.to_string());
                desc.set_annotations(Some(annotations));
            }
            None => {
                if manifests
                    .iter()
                    .any(|d| d.digest() == desc.digest() && entry_tag(d).is_none())
                {
                    return Ok(());
                }
            }
        }
        manifests.push(desc);
        let mut idx = idx;
        idx.set_manifests(manifests);
        self.write_index(&idx).await
    }

    /// Track a referrer under the `<algo>-<hex64>` fallback tag: the tag
    /// points at an image index listing every referrer of the subject.
    async fn register_referrer(&self, m: &Manifest, subject: &Descriptor) -> Result<()> {
        let tag = fallback_tag(subject.digest());
        let referrer = m.referrer_descriptor()?;
        let mut entries = match self.read_referrer_index(&tag).await? {
            Some(ii) => ii.manifests().clone(),
            None => Vec::new(),
        };
        if entries.iter().any(|d| d.digest() == referrer.digest()) {
            return Ok(());
        }
        entries.push(referrer);
        let ii = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(entries)
            .build()
            .map_err(|e| Error::ParseError(e.to_string()))?;
        let index_manifest = Manifest::from_index(&ii)?;
        self.write_blob_bytes(index_manifest.digest(), index_manifest.raw())
            .await?;
        self.upsert_entry(index_manifest.descriptor(), Some(&tag))
            .await?;
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn read_referrer_index(&self, tag: &str) -> Result<Option<ImageIndex>> {
        let idx = self.read_index_or_empty().await?;
        let Some(entry) = idx.manifests().iter().find(|d| entry_tag(d) == Some(tag)) else {
            return Ok(None);
        };
        let raw = self.read_blob_by_digest(&entry.digest().to_string()).await?;
        Ok(Some(serde_json::from_slice(&raw).map_err(|e| {
            Error::ParseError(format!("bad referrers index: {e}"))
        })?))
    }

    async fn run_gc(&self) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let idx = match self.read_index().await {
            Ok(idx) => idx,
            // nothing written yet, nothing to sweep
            Err(Error::ParseError(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        let mut marked: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = idx
            .manifests()
            .iter()
            .map(|d| d.digest().to_string())
            .collect();
        while let Some(dig) = stack.pop() {
            if !marked.insert(dig.clone()) {
                continue;
            }
            let raw = match self.read_blob_by_digest(&dig).await {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            match Manifest::from_bytes(None, raw) {
                Ok(m) if m.is_list() => {
                    for child in m.manifest_list()? {
                        stack.push(child.digest().to_string());
                    }
                }
                Ok(m) => {
                    if let Some(config) = m.config_descriptor() {
                        marked.insert(config.digest().to_string());
                    }
                    for layer in m.layers().unwrap_or_default() {
                        marked.insert(layer.digest().to_string());
                    }
                    if let Some(subject) = m.subject() {
                        marked.insert(subject.digest().to_string());
                    }
                }
                // reachable but not a manifest; keep it marked and move on
                Err(_) => {}
            }
        }

        let blobs_dir = self.root.join("blobs");
        let algos = match std::fs::read_dir(&blobs_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        let mut removed = 0usize;
        for algo_entry in algos.flatten() {
            if !algo_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let algo = algo_entry.file_name();
            let Some(algo) = algo.to_str() else { continue };
            let hex_len = match algo {
                "sha256" => 64,
                "sha512" => 128,
                _ => continue,
            };
            let Ok(files) = std::fs::read_dir(algo_entry.path()) else {
                continue;
            };
            for file in files.flatten() {
                let name = file.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.len() != hex_len
                    || !name
                        .bytes()
                        .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
                {
                    // tmp files and anything else that is not a blob
                    continue;
                }
                if !marked.contains(&format!("{algo}:{name}")) {
                    if let Err(e) = std::fs::remove_file(file.path()) {
                        warn!("gc failed to remove {:?}: {e:?}", file.path());
                    } else {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            info!("gc removed {removed} blobs from {:?}", self.root);
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryDriver for OciDir {
    async fn manifest_head(&self, r: &Reference) -> Result<Descriptor> {
        let idx = self.read_index().await?;
        self.resolve(&idx, r).await
    }

    async fn manifest_get(&self, r: &Reference) -> Result<Manifest> {
        let idx = self.read_index().await?;
        let desc = self.resolve(&idx, r).await?;
        let raw = self.read_blob_by_digest(&desc.digest().to_string()).await?;
        let mt = desc.media_type().to_string();
        Manifest::from_bytes_verified(Some(mt.as_str()), raw, Some(desc.digest()))
    }

    async fn manifest_put(&self, r: &Reference, m: &Manifest, child: bool) -> Result<()> {
        self.write_blob_bytes(m.digest(), m.raw()).await?;
        self.dirty.store(true, Ordering::Relaxed);
        if child {
            // children stay reachable through the parent index; listing them
            // in index.json would pin them past the parent's deletion
            return Ok(());
        }
        let tag = (!r.tag.is_empty()).then_some(r.tag.as_str());
        self.upsert_entry(m.descriptor(), tag).await?;
        if let Some(subject) = m.subject() {
            self.register_referrer(m, subject).await?;
        }
        Ok(())
    }

    async fn manifest_delete(&self, r: &Reference) -> Result<()> {
        if r.digest.is_empty() {
            return Err(Error::MissingDigest);
        }
        {
            let _guard = self.index_lock.lock().await;
            let idx = self.read_index().await?;
            let mut manifests = idx.manifests().clone();
            manifests.retain(|d| d.digest().to_string() != r.digest);
            let mut idx = idx;
            idx.set_manifests(manifests);
            self.write_index(&idx).await?;
        }
        // checked at parse time
        let (algo, hex) = r.digest.split_once(':').expect("validated digest");
        let path = self.root.join("blobs").join(algo).join(hex);
        let _ = tokio::fs::remove_file(&path).await;
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn blob_head(&self, _r: &Reference, d: &Descriptor) -> Result<Descriptor> {
        let path = self.blob_path(d.digest());
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        let size = if d.size() > 0 { d.size() } else { meta.len() };
        Ok(Descriptor::new(
            d.media_type().clone(),
            size,
            d.digest().clone(),
        ))
    }

    async fn blob_get(&self, _r: &Reference, d: &Descriptor) -> Result<BlobStream> {
        let path = self.blob_path(d.digest());
        let file = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let size = if d.size() > 0 {
            d.size()
        } else {
            file.metadata().await?.len()
        };
        let inner: BlobStream = ReaderStream::new(file)
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();
        Ok(Box::pin(DigestStream::new(inner, Some(d.digest()), size)))
    }

    async fn blob_put(
        &self,
        _r: &Reference,
        d: Option<&Descriptor>,
        mut stream: BlobStream,
    ) -> Result<Descriptor> {
        let _permit = self
            .write_throttle
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Canceled)?;

        let algo = d
            .map(|d| d.digest().algorithm().as_ref().to_string())
            .unwrap_or_else(|| "sha256".to_string());
        let dir = self.root.join("blobs").join(&algo);
        tokio::fs::create_dir_all(&dir).await?;
        let tmp = tempfile::Builder::new().suffix(".tmp").tempfile_in(&dir)?;
        let mut file = tokio::fs::File::from_std(tmp.as_file().try_clone()?);

        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        while let Some(chunk) = stream.next().await {
            // an upstream error drops tmp on the way out; never renamed
            let chunk = chunk?;
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);

        let computed = hex::encode(hasher.finalize());
        let dig = match d {
            Some(d) => {
                if d.size() > 0 && d.size() != size {
                    return Err(Error::SizeMismatch);
                }
                if d.digest().algorithm().as_ref() == "sha256" && d.digest().digest() != computed {
                    return Err(Error::DigestMismatch);
                }
                d.digest().clone()
            }
            None => {
                use std::str::FromStr;
                oci_spec::image::Sha256Digest::from_str(&computed)
                    .map(Into::into)
                    .map_err(|e| Error::ParseError(e.to_string()))?
            }
        };

        let final_path = self.root.join("blobs").join(&algo).join(dig.digest());
        tmp.persist(&final_path).map_err(|e| Error::Io(e.error))?;
        self.dirty.store(true, Ordering::Relaxed);
        let media_type = d
            .map(|d| d.media_type().clone())
            .unwrap_or_else(|| "application/octet-stream".into());
        Ok(Descriptor::new(media_type, size, dig))
    }

    async fn blob_delete(&self, _r: &Reference, d: &Descriptor) -> Result<()> {
        let path = self.blob_path(d.digest());
        tokio::fs::remove_file(&path)
            .await
            .map_err(|_| Error::NotFound(d.digest().to_string()))?;
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn tag_list(&self, _r: &Reference) -> Result<Vec<String>> {
        let idx = self.read_index().await?;
        let mut tags: Vec<String> = idx
            .manifests()
            .iter()
            .filter_map(entry_tag)
            .filter(|t| !t.contains(':'))
            .map(|t| t.to_string())
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    async fn tag_delete(&self, r: &Reference) -> Result<()> {
        if r.tag.is_empty() {
            return Err(Error::MissingTag);
        }
        let _guard = self.index_lock.lock().await;
        let idx = self.read_index().await?;
        let mut manifests = idx.manifests().clone();
        let before = manifests.len();
        manifests.retain(|d| entry_tag(d) != Some(r.tag.as_str()));
        if manifests.len() == before {
            return Err(Error::NotFound(r.common_name()));
        }
        let mut idx = idx;
        idx.set_manifests(manifests);
        self.write_index(&idx).await?;
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn repo_list(&self, _r: &Reference, _last: Option<&str>) -> Result<Vec<String>> {
        Err(Error::UnsupportedApi(
            "repository listing on an oci layout".into(),
        ))
    }

    async fn referrer_list(
        &self,
        r: &Reference,
        filters: &[ReferrerFilter],
    ) -> Result<Vec<Descriptor>> {
        if r.digest.is_empty() {
            return Err(Error::MissingDigest);
        }
        digest::validate(&r.digest)?;
        let tag = fallback_tag_str(&r.digest);
        let Some(ii) = self.read_referrer_index(&tag).await? else {
            return Ok(Vec::new());
        };
        Ok(ii
            .manifests()
            .iter()
            .filter(|d| referrer_matches(filters, d))
            .cloned()
            .collect())
    }

    async fn rate_limit(&self, _r: &Reference) -> Option<RateLimit> {
        None
    }

    async fn ping(&self, r: &Reference) -> Result<()> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|_| Error::FileNotFound(r.common_name()))?;
        if !meta.is_dir() {
            return Err(Error::ParseError(format!("{:?} is not a directory", self.root)));
        }
        Ok(())
    }

    async fn close(&self, r: &Reference) -> Result<()> {
        if self.gc && self.dirty.swap(false, Ordering::Relaxed) {
            debug!("gc {:?} after mutations via {}", self.root, r.common_name());
            self.run_gc().await?;
        }
        Ok(())
    }
}

fn entry_tag(d: &Descriptor) -> Option<&str> {
    d.annotations()
        .as_ref()
        .and_then(|a| a.get(REF_NAME_ANNOTATION))
        .map(|s| s.as_str())
}

pub fn fallback_tag(subject: &Digest) -> String {
    fallback_tag_str(&subject.to_string())
}

/// `<algo>-<hex64>`: the pre-referrers-API tag convention.
pub fn fallback_tag_str(dig: &str) -> String {
    let (algo, hex) = dig.split_once(':').unwrap_or(("sha256", dig));
    format!("{}-{}", algo, &hex[..hex.len().min(64)])
}

fn empty_index() -> Result<ImageIndex> {
    ImageIndexBuilder::default()
        .schema_version(2u32)
        .media_type(MediaType::ImageIndex)
        .manifests(Vec::new())
        .build()
        .map_err(|e| Error::ParseError(e.to_string()))
}

fn write_file_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    let tmp = tempfile::Builder::new().suffix(".tmp").tempfile_in(dir)?;
    tmp.as_file().write_all(data)?;
    tmp.persist(dir.join(name)).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{bytes_stream, stream_to_bytes};
    use oci_spec::image::{ImageManifestBuilder, MediaType};

    fn store(dir: &tempfile::TempDir, gc: bool) -> OciDir {
        OciDir::new(dir.path().join("repo"), gc)
    }

    fn rref(dir: &tempfile::TempDir, suffix: &str) -> Reference {
        Reference::parse(&format!(
            "ocidir://{}/repo{suffix}",
            dir.path().display()
        ))
        .unwrap()
    }

    async fn put_blob(s: &OciDir, r: &Reference, data: &'static [u8]) -> Descriptor {
        let d = Descriptor::new(
            MediaType::ImageLayerGzip,
            data.len() as u64,
            digest::from_data(data),
        );
        s.blob_put(r, Some(&d), bytes_stream(Bytes::from_static(data)))
            .await
            .unwrap()
    }

    async fn put_image(
        s: &OciDir,
        r: &Reference,
        tag: &str,
        config: &'static [u8],
        layer: &'static [u8],
    ) -> Manifest {
        let config_desc = {
            let mut d = put_blob(s, r, config).await;
            d.set_media_type(MediaType::ImageConfig);
            d
        };
        let layer_desc = put_blob(s, r, layer).await;
        let im = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(config_desc)
            .layers(vec![layer_desc])
            .build()
            .unwrap();
        let m = Manifest::from_image(&im).unwrap();
        s.manifest_put(&r.with_tag(tag).unwrap(), &m, false)
            .await
            .unwrap();
        m
    }

    #[tokio::test]
    async fn test_manifest_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, false);
        let r = rref(&tmp, "");
        let m = put_image(&s, &r, "v1", b"{\"arch\":\"amd64\"}", b"layer one").await;

        let got = s.manifest_get(&r.with_tag("v1").unwrap()).await.unwrap();
        assert_eq!(got.raw(), m.raw());
        assert_eq!(got.digest(), m.digest());

        // by digest too
        let got = s
            .manifest_get(&r.with_digest(&m.digest().to_string()).unwrap())
            .await
            .unwrap();
        assert_eq!(got.raw(), m.raw());

        let head = s.manifest_head(&r.with_tag("v1").unwrap()).await.unwrap();
        assert_eq!(head.digest(), m.digest());
    }

    #[tokio::test]
    async fn test_missing_layout_is_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, false);
        let r = rref(&tmp, ":v1");
        assert!(matches!(
            s.manifest_get(&r).await,
            Err(Error::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_ref_means_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, false);
        let r = rref(&tmp, "");
        let m = put_image(&s, &r, "latest", b"{}", b"layer").await;
        let got = s.manifest_get(&r).await.unwrap();
        assert_eq!(got.digest(), m.digest());
    }

    #[tokio::test]
    async fn test_blob_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, false);
        let r = rref(&tmp, "");
        let d = put_blob(&s, &r, b"some layer bytes").await;
        let out = stream_to_bytes(s.blob_get(&r, &d).await.unwrap())
            .await
            .unwrap();
        assert_eq!(out.as_ref(), b"some layer bytes");
        let head = s.blob_head(&r, &d).await.unwrap();
        assert_eq!(head.size(), 16);
    }

    #[tokio::test]
    async fn test_blob_put_digest_mismatch_discards_tmp() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, false);
        let r = rref(&tmp, "");
        let wrong = Descriptor::new(
            MediaType::ImageLayerGzip,
            4,
            digest::from_data("something else"),
        );
        let res = s
            .blob_put(&r, Some(&wrong), bytes_stream(Bytes::from_static(b"data")))
            .await;
        assert!(matches!(res, Err(Error::DigestMismatch)));
        // neither the final blob nor any tmp residue may exist
        assert!(s.read_blob_by_digest(&wrong.digest().to_string()).await.is_err());
        let dir = tmp.path().join("repo/blobs/sha256");
        if let Ok(entries) = std::fs::read_dir(&dir) {
            assert_eq!(entries.count(), 0);
        }
    }

    #[tokio::test]
    async fn test_tag_list_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, false);
        let r = rref(&tmp, "");
        put_image(&s, &r, "v2", b"{}", b"l2").await;
        put_image(&s, &r, "v1", b"{}", b"l1").await;
        assert_eq!(s.tag_list(&r).await.unwrap(), vec!["v1", "v2"]);

        s.tag_delete(&r.with_tag("v1").unwrap()).await.unwrap();
        assert_eq!(s.tag_list(&r).await.unwrap(), vec!["v2"]);
        assert!(matches!(
            s.tag_delete(&r.with_tag("v1").unwrap()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ping() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, false);
        let r = rref(&tmp, "");
        assert!(s.ping(&r).await.is_err());
        put_image(&s, &r, "v1", b"{}", b"l1").await;
        s.ping(&r).await.unwrap();
    }

    #[tokio::test]
    async fn test_manifest_delete_keeps_other_tags_reachable() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, true);
        let r = rref(&tmp, "");
        let doomed = put_image(&s, &r, "v1", b"{\"d\":1}", b"doomed layer").await;
        // second tag on the same digest
        s.manifest_put(&r.with_tag("v1-copy").unwrap(), &doomed, false)
            .await
            .unwrap();
        let kept = put_image(&s, &r, "v2", b"{\"d\":2}", b"kept layer").await;

        s.manifest_delete(&r.with_digest(&doomed.digest().to_string()).unwrap())
            .await
            .unwrap();
        s.close(&r).await.unwrap();

        // both tags of the deleted digest are gone, v2 is intact
        assert_eq!(s.tag_list(&r).await.unwrap(), vec!["v2"]);
        let got = s.manifest_get(&r.with_tag("v2").unwrap()).await.unwrap();
        assert_eq!(got.digest(), kept.digest());
        for layer in kept.layers().unwrap() {
            assert!(
                s.read_blob_by_digest(&layer.digest().to_string())
                    .await
                    .is_ok()
            );
        }
    }

    #[tokio::test]
    async fn test_manifest_delete_requires_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, false);
        let r = rref(&tmp, "");
        put_image(&s, &r, "v1", b"{}", b"l1").await;
        assert!(matches!(
            s.manifest_delete(&r.with_tag("v1").unwrap()).await,
            Err(Error::MissingDigest)
        ));
    }

    #[tokio::test]
    async fn test_gc_sweeps_unreachable() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, true);
        let r = rref(&tmp, "");
        let m1 = put_image(&s, &r, "v1", b"{\"v\":1}", b"layer one").await;
        let m2 = put_image(&s, &r, "v2", b"{\"v\":2}", b"layer two").await;

        // drop the v1 tag then close; v1's tree should be swept, v2's kept
        s.tag_delete(&r.with_tag("v1").unwrap()).await.unwrap();
        s.close(&r).await.unwrap();

        assert!(
            s.read_blob_by_digest(&m1.digest().to_string())
                .await
                .is_err()
        );
        assert!(
            s.read_blob_by_digest(&m2.digest().to_string())
                .await
                .is_ok()
        );
        // every digest reachable from the index still has its blob
        for layer in m2.layers().unwrap() {
            assert!(
                s.read_blob_by_digest(&layer.digest().to_string())
                    .await
                    .is_ok()
            );
        }
        assert!(
            s.read_blob_by_digest(&m2.config_descriptor().unwrap().digest().to_string())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_gc_ignores_stray_files() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, true);
        let r = rref(&tmp, "");
        put_image(&s, &r, "v1", b"{}", b"layer").await;
        let stray = tmp.path().join("repo/blobs/sha256/notahexname.tmp");
        std::fs::write(&stray, b"in flight").unwrap();
        s.close(&r).await.unwrap();
        assert!(stray.exists());
    }

    #[tokio::test]
    async fn test_referrer_registration_and_list() {
        let tmp = tempfile::tempdir().unwrap();
        let s = store(&tmp, false);
        let r = rref(&tmp, "");
        let subject = put_image(&s, &r, "v1", b"{}", b"layer").await;

        let empty = put_blob(&s, &r, b"{}").await;
        let artifact = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .artifact_type(MediaType::from("application/example.sbom"))
            .config(Descriptor::new(
                MediaType::EmptyJSON,
                empty.size(),
                empty.digest().clone(),
            ))
            .layers(Vec::new())
            .subject(subject.descriptor().clone())
            .build()
            .unwrap();
        let am = Manifest::from_image(&artifact).unwrap();
        let am_ref = r.with_digest(&am.digest().to_string()).unwrap();
        s.manifest_put(&am_ref, &am, false).await.unwrap();

        let subject_ref = r.with_digest(&subject.digest().to_string()).unwrap();
        let listed = s.referrer_list(&subject_ref, &[]).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].digest(), am.digest());

        let filtered = s
            .referrer_list(
                &subject_ref,
                &[ReferrerFilter {
                    artifact_type: Some("application/example.signature".into()),
                    ..Default::default()
                }],
            )
            .await
            .unwrap();
        assert!(filtered.is_empty());

        // the fallback tag is visible but not a plain tag with a colon
        let tags = s.tag_list(&r).await.unwrap();
        assert!(tags.iter().any(|t| t.starts_with("sha256-")));
    }
}
