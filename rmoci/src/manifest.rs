use std::collections::HashMap;

use bytes::Bytes;
use oci_spec::image::{
    Descriptor, DescriptorBuilder, Digest, ImageIndex, ImageManifest, MediaType, Platform,
};

use crate::digest;
use crate::error::{Error, Result};

pub const MT_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MT_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MT_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MT_DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// The canonical manifest types a sync covers unless configured otherwise.
pub const DEFAULT_MEDIA_TYPES: [&str; 4] = [
    MT_OCI_INDEX,
    MT_OCI_MANIFEST,
    MT_DOCKER_LIST,
    MT_DOCKER_MANIFEST,
];

pub const ACCEPT_MANIFEST: &str = "application/vnd.oci.image.index.v1+json, application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.list.v2+json, application/vnd.docker.distribution.manifest.v2+json";

pub fn is_index_media_type(mt: &str) -> bool {
    mt == MT_OCI_INDEX || mt == MT_DOCKER_LIST
}

pub fn is_image_media_type(mt: &str) -> bool {
    mt == MT_OCI_MANIFEST || mt == MT_DOCKER_MANIFEST
}

#[derive(Clone, Debug)]
enum Body {
    Image(ImageManifest),
    Index(ImageIndex),
}

/// A fetched manifest: the raw bytes it was served as, the descriptor it
/// travels under, and the parsed form. The raw bytes are authoritative;
/// re-serializing the parsed form would change the digest.
#[derive(Clone, Debug)]
pub struct Manifest {
    body: Body,
    raw: Bytes,
    desc: Descriptor,
}

impl Manifest {
    /// Parse from wire bytes. `media_type` comes from the Content-Type header
    /// or the index entry when known; with no hint we try the image form then
    /// the index form. The descriptor digest is always computed from `raw`.
    pub fn from_bytes(media_type: Option<&str>, raw: Bytes) -> Result<Manifest> {
        let body = match media_type {
            Some(mt) if is_index_media_type(mt) => Body::Index(parse_index(&raw)?),
            Some(mt) if is_image_media_type(mt) => Body::Image(parse_image(&raw)?),
            Some(other) => return Err(Error::UnsupportedMediaType(other.to_string())),
            None => match parse_image(&raw) {
                Ok(im) => Body::Image(im),
                Err(_) => Body::Index(parse_index(&raw).map_err(|_| {
                    Error::ParseError("manifest parses as neither image nor index".into())
                })?),
            },
        };
        let dig = digest::from_data(&raw);
        let mt = match media_type {
            Some(mt) => mt.to_string(),
            None => match &body {
                Body::Image(im) => render_media_type(im.media_type(), MT_OCI_MANIFEST),
                Body::Index(ii) => render_media_type(ii.media_type(), MT_OCI_INDEX),
            },
        };
        let desc = Descriptor::new(mt.as_str().into(), raw.len() as u64, dig);
        Ok(Manifest { body, raw, desc })
    }

    /// Like `from_bytes` but errors with `DigestMismatch` when the bytes do
    /// not hash to `expected`.
    pub fn from_bytes_verified(
        media_type: Option<&str>,
        raw: Bytes,
        expected: Option<&Digest>,
    ) -> Result<Manifest> {
        digest::check_data_matches(expected, &raw)?;
        Self::from_bytes(media_type, raw)
    }

    pub fn from_image(im: &ImageManifest) -> Result<Manifest> {
        let raw = Bytes::from(serde_json::to_vec(im)?);
        let mt = render_media_type(im.media_type(), MT_OCI_MANIFEST);
        Self::from_bytes(Some(mt.as_str()), raw)
    }

    pub fn from_index(ii: &ImageIndex) -> Result<Manifest> {
        let raw = Bytes::from(serde_json::to_vec(ii)?);
        let mt = render_media_type(ii.media_type(), MT_OCI_INDEX);
        Self::from_bytes(Some(mt.as_str()), raw)
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    pub fn digest(&self) -> &Digest {
        self.desc.digest()
    }

    pub fn media_type(&self) -> String {
        self.desc.media_type().to_string()
    }

    pub fn is_list(&self) -> bool {
        matches!(self.body, Body::Index(_))
    }

    pub fn manifest_list(&self) -> Result<&[Descriptor]> {
        match &self.body {
            Body::Index(ii) => Ok(ii.manifests()),
            Body::Image(_) => Err(Error::UnsupportedMediaType(self.media_type())),
        }
    }

    pub fn config_descriptor(&self) -> Option<&Descriptor> {
        match &self.body {
            Body::Image(im) => Some(im.config()),
            Body::Index(_) => None,
        }
    }

    pub fn layers(&self) -> Option<&[Descriptor]> {
        match &self.body {
            Body::Image(im) => Some(im.layers()),
            Body::Index(_) => None,
        }
    }

    pub fn subject(&self) -> Option<&Descriptor> {
        match &self.body {
            Body::Image(im) => im.subject().as_ref(),
            Body::Index(ii) => ii.subject().as_ref(),
        }
    }

    pub fn artifact_type(&self) -> Option<String> {
        let at = match &self.body {
            Body::Image(im) => im.artifact_type().as_ref(),
            Body::Index(ii) => ii.artifact_type().as_ref(),
        };
        at.map(|mt| mt.to_string())
    }

    pub fn annotations(&self) -> Option<&HashMap<String, String>> {
        match &self.body {
            Body::Image(im) => im.annotations().as_ref(),
            Body::Index(ii) => ii.annotations().as_ref(),
        }
    }

    /// Find the index child for a `os/arch[/variant]` platform string.
    pub fn platform_descriptor(&self, platform: &str) -> Result<Option<&Descriptor>> {
        let children = self.manifest_list()?;
        Ok(children.iter().find(|d| {
            d.platform()
                .as_ref()
                .map(|p| platform_string(p) == platform)
                .unwrap_or(false)
        }))
    }

    /// The descriptor form used inside a referrers index: the manifest's
    /// descriptor enriched with its artifact type and annotations. An image
    /// manifest without an artifact type reports its config media type, per
    /// the referrers convention.
    pub fn referrer_descriptor(&self) -> Result<Descriptor> {
        let artifact_type = match self.artifact_type() {
            Some(at) => Some(at),
            None => self.config_descriptor().map(|c| c.media_type().to_string()),
        };
        let mut b = DescriptorBuilder::default()
            .media_type(self.desc.media_type().clone())
            .digest(self.desc.digest().clone())
            .size(self.desc.size());
        if let Some(at) = artifact_type {
            b = b.artifact_type(MediaType::from(at.as_str()));
        }
        if let Some(annotations) = self.annotations() {
            b = b.annotations(annotations.clone());
        }
        b.build().map_err(|e| Error::ParseError(e.to_string()))
    }
}

fn parse_image(raw: &[u8]) -> Result<ImageManifest> {
    Ok(serde_json::from_slice::<ImageManifest>(raw)?)
}

fn parse_index(raw: &[u8]) -> Result<ImageIndex> {
    Ok(serde_json::from_slice::<ImageIndex>(raw)?)
}

fn render_media_type(mt: &Option<MediaType>, fallback: &str) -> String {
    mt.as_ref()
        .map(|m| m.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

pub fn platform_string(p: &Platform) -> String {
    match p.variant() {
        Some(v) => format!("{}/{}/{}", p.os(), p.architecture(), v),
        None => format!("{}/{}", p.os(), p.architecture()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::{Arch, ImageIndexBuilder, ImageManifestBuilder, Os, PlatformBuilder};

    fn image_manifest() -> ImageManifest {
        let config = Descriptor::new(
            MediaType::ImageConfig,
            2,
            digest::from_data("{}"),
        );
        let layer = Descriptor::new(
            MediaType::ImageLayerGzip,
            3,
            digest::from_data("abc"),
        );
        ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(config)
            .layers(vec![layer])
            .build()
            .unwrap()
    }

    #[test]
    fn test_image_round_trip() {
        let m = Manifest::from_image(&image_manifest()).unwrap();
        assert!(!m.is_list());
        assert_eq!(m.media_type(), MT_OCI_MANIFEST);
        assert!(m.config_descriptor().is_some());
        assert_eq!(m.layers().unwrap().len(), 1);
        assert!(m.manifest_list().is_err());
        assert!(m.subject().is_none());

        let again = Manifest::from_bytes(None, m.raw().clone()).unwrap();
        assert_eq!(again.digest(), m.digest());
        assert_eq!(again.raw(), m.raw());
    }

    #[test]
    fn test_index_platform_lookup() {
        let child = Manifest::from_image(&image_manifest()).unwrap();
        let p = PlatformBuilder::default()
            .os(Os::Linux)
            .architecture(Arch::Amd64)
            .build()
            .unwrap();
        let mut desc = child.descriptor().clone();
        desc.set_platform(Some(p));
        let ii = ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageIndex)
            .manifests(vec![desc])
            .build()
            .unwrap();
        let m = Manifest::from_index(&ii).unwrap();
        assert!(m.is_list());
        assert_eq!(m.manifest_list().unwrap().len(), 1);
        let found = m.platform_descriptor("linux/amd64").unwrap().unwrap();
        assert_eq!(found.digest(), child.digest());
        assert!(m.platform_descriptor("linux/arm64").unwrap().is_none());
    }

    #[test]
    fn test_digest_verification() {
        let m = Manifest::from_image(&image_manifest()).unwrap();
        let other = digest::from_data("not the manifest");
        assert!(matches!(
            Manifest::from_bytes_verified(None, m.raw().clone(), Some(&other)),
            Err(Error::DigestMismatch)
        ));
        assert!(
            Manifest::from_bytes_verified(None, m.raw().clone(), Some(m.digest())).is_ok()
        );
    }
}
