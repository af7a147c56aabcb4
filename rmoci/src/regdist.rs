use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, trace};
use moka::{Expiry, future::Cache};
use oci_spec::image::{Descriptor, Digest, ImageIndex};
use reqwest::{Method, Response, StatusCode, header, header::HeaderValue};
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tokio::sync::RwLock;

use crate::driver::{
    BlobStream, DigestStream, RateLimit, ReferrerFilter, RegistryDriver, referrer_matches,
};
use crate::error::{Error, Result};
use crate::manifest::{ACCEPT_MANIFEST, Manifest};
use crate::ocidir::fallback_tag_str;
use crate::reference::Reference;

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const OCI_SUBJECT_HEADER: &str = "oci-subject";
const CATALOG_PAGE: usize = 1000;

#[derive(Clone, Debug, Default)]
pub enum Auth {
    #[default]
    Anonymous,
    UserPass(String, String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsMode {
    #[default]
    Enabled,
    Insecure,
    Disabled,
}

#[derive(Clone, Debug, Default)]
pub struct HostConfig {
    pub auth: Auth,
    pub tls: TlsMode,
}

pub type HostMap = BTreeMap<String, HostConfig>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    Pull,
    Push,
}

impl Scope {
    fn actions(&self) -> &'static str {
        match self {
            Scope::Pull => "pull",
            Scope::Push => "pull,push",
        }
    }
}

// registry/repo:actions; ghcr for one ignores scope on its tokens but
// docker hub does not, so the scope is part of the key
#[derive(PartialEq, Eq, Hash, Debug)]
struct TokenKey(String);

impl TokenKey {
    fn new(r: &Reference, scope: Scope) -> TokenKey {
        TokenKey(format!("{}/{}:{}", r.registry, r.repository, scope.actions()))
    }
}

#[derive(Clone)]
struct Token {
    token: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        _key: &TokenKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        trace!("{_key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

pub struct RegClientBuilder {
    hosts: HostMap,
    user_agent: String,
}

impl Default for RegClientBuilder {
    fn default() -> RegClientBuilder {
        RegClientBuilder {
            hosts: BTreeMap::new(),
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl RegClientBuilder {
    pub fn hosts(mut self, hosts: HostMap) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    pub fn build(self) -> Result<RegClient> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent(&self.user_agent)
            .build()?;
        let client_insecure = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(3))
            .user_agent(&self.user_agent)
            .danger_accept_invalid_certs(true)
            .build()?;

        let token_cache = Cache::builder()
            .max_capacity(1_000_000)
            .weigher(|k: &TokenKey, v: &Token| {
                (k.0.len() + v.token.len()).try_into().unwrap_or(u32::MAX)
            })
            .expire_after(ExpireToken)
            .build();

        Ok(RegClient {
            client,
            client_insecure,
            token_cache,
            hosts: self.hosts,
            ratelimits: RwLock::new(BTreeMap::new()),
        })
    }
}

/// Driver for the `reg` scheme: a distribution-spec registry over HTTP.
/// Bearer tokens are fetched through the WWW-Authenticate challenge and
/// cached per registry+repo+scope; rate-limit headers are recorded on every
/// response so the sync engine can throttle itself before the registry does.
pub struct RegClient {
    client: reqwest::Client,
    client_insecure: reqwest::Client,
    token_cache: Cache<TokenKey, Token>,
    hosts: HostMap,
    ratelimits: RwLock<BTreeMap<String, RateLimit>>,
}

impl RegClient {
    pub fn builder() -> RegClientBuilder {
        RegClientBuilder::default()
    }

    fn host(&self, registry: &str) -> HostConfig {
        self.hosts.get(registry).cloned().unwrap_or_default()
    }

    fn http_client(&self, registry: &str) -> &reqwest::Client {
        match self.host(registry).tls {
            TlsMode::Insecure => &self.client_insecure,
            _ => &self.client,
        }
    }

    fn base_url(&self, registry: &str) -> String {
        let scheme = match self.host(registry).tls {
            TlsMode::Disabled => "http",
            _ => "https",
        };
        format!("{scheme}://{registry}/v2")
    }

    fn manifest_url(&self, r: &Reference) -> String {
        let which = if !r.digest.is_empty() {
            r.digest.as_str()
        } else if !r.tag.is_empty() {
            r.tag.as_str()
        } else {
            "latest"
        };
        format!(
            "{}/{}/manifests/{}",
            self.base_url(&r.registry),
            r.repository,
            which
        )
    }

    fn blob_url(&self, r: &Reference, dig: &Digest) -> String {
        format!(
            "{}/{}/blobs/{}",
            self.base_url(&r.registry),
            r.repository,
            dig
        )
    }

    async fn note_ratelimit(&self, registry: &str, res: &Response) {
        if let Some(rl) = parse_ratelimit_headers(res.headers()) {
            trace!("{registry} ratelimit remaining {}", rl.remaining);
            self.ratelimits.write().await.insert(registry.to_string(), rl);
        }
    }

    async fn get_token(
        &self,
        r: &Reference,
        scope: Scope,
        challenge: &BearerChallenge<'_>,
    ) -> Result<Token> {
        let host = self.host(&r.registry);
        let entry = self
            .token_cache
            .entry(TokenKey::new(r, scope))
            .or_try_insert_with(fetch_token(
                self.http_client(&r.registry).clone(),
                &host.auth,
                r,
                scope,
                challenge,
            ))
            .await
            .map_err(|e: Arc<Error>| {
                error!("token fetch for {} failed: {e:?}", r.registry);
                Error::StatusNotOk(StatusCode::UNAUTHORIZED)
            })?;
        if entry.is_fresh() {
            trace!("new token for {}", entry.key().0);
        }
        Ok(entry.into_value())
    }

    /// Send with a cached token if any; on 401 follow the challenge for a
    /// fresh token and retry once. Only usable for clonable request bodies.
    async fn send_authed(
        &self,
        r: &Reference,
        scope: Scope,
        mut req: reqwest::RequestBuilder,
    ) -> Result<Response> {
        let req_copy = req
            .try_clone()
            .ok_or_else(|| Error::InvalidInput("request body not clonable".into()))?;

        if let Some(token) = self.token_cache.get(&TokenKey::new(r, scope)).await {
            req = req.bearer_auth(token.token);
        }
        let res = req.send().await?;
        self.note_ratelimit(&r.registry, &res).await;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        let challenge = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(parse_bearer_challenge_header)
            .ok_or_else(|| {
                error!(
                    "401 without a usable www-authenticate header from {}",
                    r.registry
                );
                Error::StatusNotOk(StatusCode::UNAUTHORIZED)
            })?;
        let token = self.get_token(r, scope, &challenge).await?;
        let res = req_copy.bearer_auth(token.token).send().await?;
        self.note_ratelimit(&r.registry, &res).await;
        Ok(res)
    }

    /// Token for a request whose body cannot be replayed (streaming upload):
    /// trigger the challenge with a bare ping first, then send once.
    async fn ensure_token(&self, r: &Reference, scope: Scope) -> Result<Option<String>> {
        if let Some(token) = self.token_cache.get(&TokenKey::new(r, scope)).await {
            return Ok(Some(token.token));
        }
        let url = format!("{}/", self.base_url(&r.registry));
        let res = self
            .http_client(&r.registry)
            .request(Method::GET, &url)
            .send()
            .await?;
        self.note_ratelimit(&r.registry, &res).await;
        if res.status() != StatusCode::UNAUTHORIZED {
            // registry does not require auth
            return Ok(None);
        }
        let challenge = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(parse_bearer_challenge_header)
            .ok_or(Error::StatusNotOk(StatusCode::UNAUTHORIZED))?;
        let token = self.get_token(r, scope, &challenge).await?;
        Ok(Some(token.token))
    }

    async fn put_manifest_http(&self, r: &Reference, m: &Manifest) -> Result<Response> {
        let req = self
            .http_client(&r.registry)
            .request(Method::PUT, self.manifest_url(r))
            .header(header::CONTENT_TYPE, m.media_type())
            .body(m.raw().clone());
        let res = self.send_authed(r, Scope::Push, req).await?;
        if !res.status().is_success() {
            return Err(status_not_ok(res).await);
        }
        Ok(res)
    }

    /// Registries without the referrers API get the referrer recorded under
    /// the fallback tag, an index the client maintains itself.
    async fn register_referrer_fallback(&self, r: &Reference, m: &Manifest) -> Result<()> {
        let Some(subject) = m.subject() else {
            return Ok(());
        };
        let tag = fallback_tag_str(&subject.digest().to_string());
        let tag_ref = r.with_tag(&tag)?;
        let mut entries = match self.manifest_get(&tag_ref).await {
            Ok(existing) => existing.manifest_list()?.to_vec(),
            Err(Error::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let referrer = m.referrer_descriptor()?;
        if entries.iter().any(|d| d.digest() == referrer.digest()) {
            return Ok(());
        }
        entries.push(referrer);
        let ii = oci_spec::image::ImageIndexBuilder::default()
            .schema_version(2u32)
            .media_type(oci_spec::image::MediaType::ImageIndex)
            .manifests(entries)
            .build()
            .map_err(|e| Error::ParseError(e.to_string()))?;
        let index_manifest = Manifest::from_index(&ii)?;
        self.put_manifest_http(&tag_ref, &index_manifest).await?;
        Ok(())
    }
}

#[async_trait]
impl RegistryDriver for RegClient {
    async fn manifest_head(&self, r: &Reference) -> Result<Descriptor> {
        let req = self
            .http_client(&r.registry)
            .request(Method::HEAD, self.manifest_url(r))
            .header(header::ACCEPT, ACCEPT_MANIFEST);
        let res = self.send_authed(r, Scope::Pull, req).await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound(r.common_name())),
            _ => return Err(status_not_ok(res).await),
        }
        let dig = match res
            .headers()
            .get(DOCKER_CONTENT_DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(s) => s
                .parse::<Digest>()
                .map_err(|_| Error::ParseError(format!("bad content digest {s}")))?,
            None if !r.digest.is_empty() => r
                .digest
                .parse::<Digest>()
                .map_err(|_| Error::ParseError(format!("bad digest {}", r.digest)))?,
            None => {
                return Err(Error::UnsupportedApi(format!(
                    "{} returns no digest on HEAD",
                    r.registry
                )));
            }
        };
        let media_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let size = res
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0u64);
        Ok(Descriptor::new(media_type.as_str().into(), size, dig))
    }

    async fn manifest_get(&self, r: &Reference) -> Result<Manifest> {
        let req = self
            .http_client(&r.registry)
            .request(Method::GET, self.manifest_url(r))
            .header(header::ACCEPT, ACCEPT_MANIFEST);
        let res = self.send_authed(r, Scope::Pull, req).await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound(r.common_name())),
            _ => return Err(status_not_ok(res).await),
        }
        let expected: Option<Digest> = if !r.digest.is_empty() {
            Some(
                r.digest
                    .parse()
                    .map_err(|_| Error::ParseError(format!("bad digest {}", r.digest)))?,
            )
        } else {
            res.headers()
                .get(DOCKER_CONTENT_DIGEST_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|s| {
                    s.parse()
                        .map_err(|_| Error::ParseError(format!("bad content digest {s}")))
                })
                .transpose()?
        };
        let media_type = res
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let raw = res.bytes().await?;
        Manifest::from_bytes_verified(media_type.as_deref(), raw, expected.as_ref())
    }

    async fn manifest_put(&self, r: &Reference, m: &Manifest, _child: bool) -> Result<()> {
        let res = self.put_manifest_http(r, m).await?;
        if m.subject().is_some() && !res.headers().contains_key(OCI_SUBJECT_HEADER) {
            self.register_referrer_fallback(r, m).await?;
        }
        Ok(())
    }

    async fn manifest_delete(&self, r: &Reference) -> Result<()> {
        let dig = if r.digest.is_empty() {
            self.manifest_head(r).await?.digest().to_string()
        } else {
            r.digest.clone()
        };
        let url = format!(
            "{}/{}/manifests/{}",
            self.base_url(&r.registry),
            r.repository,
            dig
        );
        let req = self
            .http_client(&r.registry)
            .request(Method::DELETE, url);
        let res = self.send_authed(r, Scope::Push, req).await?;
        match res.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound(r.common_name())),
            StatusCode::METHOD_NOT_ALLOWED => Err(Error::UnsupportedApi(format!(
                "{} does not allow manifest deletes",
                r.registry
            ))),
            _ => Err(status_not_ok(res).await),
        }
    }

    async fn blob_head(&self, r: &Reference, d: &Descriptor) -> Result<Descriptor> {
        let req = self
            .http_client(&r.registry)
            .request(Method::HEAD, self.blob_url(r, d.digest()));
        let res = self.send_authed(r, Scope::Pull, req).await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound(d.digest().to_string())),
            _ => return Err(status_not_ok(res).await),
        }
        let size = res
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| d.size());
        Ok(Descriptor::new(d.media_type().clone(), size, d.digest().clone()))
    }

    async fn blob_get(&self, r: &Reference, d: &Descriptor) -> Result<BlobStream> {
        let req = self
            .http_client(&r.registry)
            .request(Method::GET, self.blob_url(r, d.digest()));
        let res = self.send_authed(r, Scope::Pull, req).await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound(d.digest().to_string())),
            _ => return Err(status_not_ok(res).await),
        }
        let size = res.content_length().unwrap_or_else(|| d.size());
        let inner: BlobStream = res
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();
        Ok(Box::pin(DigestStream::new(inner, Some(d.digest()), size)))
    }

    async fn blob_put(
        &self,
        r: &Reference,
        d: Option<&Descriptor>,
        stream: BlobStream,
    ) -> Result<Descriptor> {
        // open an upload session
        let start_url = format!(
            "{}/{}/blobs/uploads/",
            self.base_url(&r.registry),
            r.repository
        );
        let req = self
            .http_client(&r.registry)
            .request(Method::POST, &start_url);
        let res = self.send_authed(r, Scope::Push, req).await?;
        if res.status() != StatusCode::ACCEPTED {
            return Err(status_not_ok(res).await);
        }
        let location = upload_location(&self.base_url(&r.registry), &res)?;

        let token = self.ensure_token(r, Scope::Push).await?;
        let known_digest = d.map(|d| d.digest().clone());
        match known_digest {
            Some(dig) => {
                let url = append_query(&location, &format!("digest={dig}"));
                let mut req = self
                    .http_client(&r.registry)
                    .request(Method::PUT, url)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(reqwest::Body::wrap_stream(stream));
                if let Some(token) = token {
                    req = req.bearer_auth(token);
                }
                let res = req.send().await?;
                self.note_ratelimit(&r.registry, &res).await;
                if !res.status().is_success() {
                    return Err(status_not_ok(res).await);
                }
                let size = d.map(|d| d.size()).unwrap_or(0);
                let media_type = d
                    .map(|d| d.media_type().clone())
                    .unwrap_or_else(|| "application/octet-stream".into());
                Ok(Descriptor::new(media_type, size, dig))
            }
            None => {
                // digest unknown: stream through a shared hasher via PATCH,
                // then commit with the computed digest
                let state = Arc::new(std::sync::Mutex::new((Sha256::new(), 0u64)));
                let state_clone = state.clone();
                let counted: BlobStream = stream
                    .map(move |chunk| {
                        let chunk = chunk?;
                        let mut guard = state_clone.lock().expect("hasher lock");
                        guard.0.update(&chunk);
                        guard.1 += chunk.len() as u64;
                        Ok(chunk)
                    })
                    .boxed();
                let mut req = self
                    .http_client(&r.registry)
                    .request(Method::PATCH, &location)
                    .header(header::CONTENT_TYPE, "application/octet-stream")
                    .body(reqwest::Body::wrap_stream(counted));
                if let Some(token) = token.clone() {
                    req = req.bearer_auth(token);
                }
                let res = req.send().await?;
                self.note_ratelimit(&r.registry, &res).await;
                if !res.status().is_success() {
                    return Err(status_not_ok(res).await);
                }
                let commit_location = upload_location(&self.base_url(&r.registry), &res)
                    .unwrap_or(location);
                let (hasher, size) = {
                    let mut guard = state.lock().expect("hasher lock");
                    let hasher = std::mem::take(&mut guard.0);
                    (hasher, guard.1)
                };
                let computed = hex::encode(hasher.finalize());
                let dig: Digest = {
                    use std::str::FromStr;
                    oci_spec::image::Sha256Digest::from_str(&computed)
                        .map(Into::into)
                        .map_err(|e| Error::ParseError(e.to_string()))?
                };
                let url = append_query(&commit_location, &format!("digest={dig}"));
                let mut req = self
                    .http_client(&r.registry)
                    .request(Method::PUT, url)
                    .header(header::CONTENT_LENGTH, "0");
                if let Some(token) = token {
                    req = req.bearer_auth(token);
                }
                let res = req.send().await?;
                self.note_ratelimit(&r.registry, &res).await;
                if !res.status().is_success() {
                    return Err(status_not_ok(res).await);
                }
                Ok(Descriptor::new(
                    "application/octet-stream".into(),
                    size,
                    dig,
                ))
            }
        }
    }

    async fn blob_delete(&self, r: &Reference, d: &Descriptor) -> Result<()> {
        let req = self
            .http_client(&r.registry)
            .request(Method::DELETE, self.blob_url(r, d.digest()));
        let res = self.send_authed(r, Scope::Push, req).await?;
        match res.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound(d.digest().to_string())),
            _ => Err(status_not_ok(res).await),
        }
    }

    async fn tag_list(&self, r: &Reference) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct TagList {
            #[allow(dead_code)]
            name: Option<String>,
            tags: Option<Vec<String>>,
        }
        let url = format!(
            "{}/{}/tags/list",
            self.base_url(&r.registry),
            r.repository
        );
        let req = self.http_client(&r.registry).request(Method::GET, url);
        let res = self.send_authed(r, Scope::Pull, req).await?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(Error::NotFound(r.common_name())),
            _ => return Err(status_not_ok(res).await),
        }
        let list: TagList = res.json().await?;
        let mut tags = list.tags.unwrap_or_default();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    async fn tag_delete(&self, r: &Reference) -> Result<()> {
        if r.tag.is_empty() {
            return Err(Error::MissingTag);
        }
        let url = format!(
            "{}/{}/manifests/{}",
            self.base_url(&r.registry),
            r.repository,
            r.tag
        );
        let req = self.http_client(&r.registry).request(Method::DELETE, url);
        let res = self.send_authed(r, Scope::Push, req).await?;
        match res.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound(r.common_name())),
            StatusCode::METHOD_NOT_ALLOWED => Err(Error::UnsupportedApi(format!(
                "{} does not allow tag deletes",
                r.registry
            ))),
            _ => Err(status_not_ok(res).await),
        }
    }

    async fn repo_list(&self, r: &Reference, last: Option<&str>) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct CatalogPage {
            repositories: Option<Vec<String>>,
        }
        let mut url = format!(
            "{}/_catalog?n={}",
            self.base_url(&r.registry),
            CATALOG_PAGE
        );
        if let Some(last) = last {
            url.push_str("&last=");
            url.push_str(last);
        }
        let req = self.http_client(&r.registry).request(Method::GET, url);
        let res = self.send_authed(r, Scope::Pull, req).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(Error::UnsupportedApi(format!(
                "{} has no catalog endpoint",
                r.registry
            )));
        }
        if res.status() != StatusCode::OK {
            return Err(status_not_ok(res).await);
        }
        let page: CatalogPage = res.json().await?;
        Ok(page.repositories.unwrap_or_default())
    }

    async fn referrer_list(
        &self,
        r: &Reference,
        filters: &[ReferrerFilter],
    ) -> Result<Vec<Descriptor>> {
        if r.digest.is_empty() {
            return Err(Error::MissingDigest);
        }
        let url = format!(
            "{}/{}/referrers/{}",
            self.base_url(&r.registry),
            r.repository,
            r.digest
        );
        let req = self.http_client(&r.registry).request(Method::GET, url);
        let res = self.send_authed(r, Scope::Pull, req).await?;
        let entries: Vec<Descriptor> = match res.status() {
            StatusCode::OK => {
                let ii: ImageIndex = res.json().await?;
                ii.manifests().clone()
            }
            // pre-referrers registries: read the fallback tag index
            StatusCode::NOT_FOUND => {
                debug!("{} has no referrers api, trying fallback tag", r.registry);
                let tag_ref = r.with_tag(&fallback_tag_str(&r.digest))?;
                match self.manifest_get(&tag_ref).await {
                    Ok(m) => m.manifest_list()?.to_vec(),
                    Err(Error::NotFound(_)) => Vec::new(),
                    Err(e) => return Err(e),
                }
            }
            _ => return Err(status_not_ok(res).await),
        };
        Ok(entries
            .into_iter()
            .filter(|d| referrer_matches(filters, d))
            .collect())
    }

    async fn rate_limit(&self, r: &Reference) -> Option<RateLimit> {
        self.ratelimits.read().await.get(&r.registry).copied()
    }

    async fn ping(&self, r: &Reference) -> Result<()> {
        let url = format!("{}/", self.base_url(&r.registry));
        let req = self.http_client(&r.registry).request(Method::GET, url);
        let res = self.send_authed(r, Scope::Pull, req).await?;
        if res.status() == StatusCode::OK {
            Ok(())
        } else {
            Err(status_not_ok(res).await)
        }
    }

    async fn close(&self, _r: &Reference) -> Result<()> {
        Ok(())
    }
}

async fn status_not_ok(res: Response) -> Error {
    let status = res.status();
    if log::log_enabled!(log::Level::Trace) {
        match res.text().await {
            Ok(body) => trace!("status={status}, body={body}"),
            Err(e) => trace!("status={status}, body unreadable: {e:?}"),
        }
    }
    Error::StatusNotOk(status)
}

async fn fetch_token(
    client: reqwest::Client,
    auth: &Auth,
    r: &Reference,
    scope: Scope,
    challenge: &BearerChallenge<'_>,
) -> Result<Token> {
    #[derive(Deserialize)]
    struct JsonToken {
        token: Option<String>,
        access_token: Option<String>,
        expires_in: Option<u64>,
    }

    let scope = format!("repository:{}:{}", r.repository, scope.actions());
    let mut req = client
        .request(Method::GET, challenge.realm)
        .query(&[("scope", scope.as_str()), ("service", challenge.service)]);
    if let Auth::UserPass(user, pass) = auth {
        req = req.basic_auth(user, Some(pass));
    }
    let token: JsonToken = req.send().await?.json().await?;

    // the token auth spec gives 60 seconds as the default lifetime
    let expires_in = Duration::from_secs(token.expires_in.unwrap_or(60));
    let token = token
        .token
        .or(token.access_token)
        .ok_or_else(|| Error::ParseError("token response without a token".into()))?;
    Ok(Token { token, expires_in })
}

fn upload_location(base: &str, res: &Response) -> Result<String> {
    let loc = res
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::UnsupportedApi("upload without a location header".into()))?;
    if loc.starts_with("http://") || loc.starts_with("https://") {
        Ok(loc.to_string())
    } else {
        // relative locations resolve against the registry origin
        let origin = base.trim_end_matches("/v2");
        Ok(format!("{origin}{loc}"))
    }
}

fn append_query(url: &str, query: &str) -> String {
    if url.contains('?') {
        format!("{url}&{query}")
    } else {
        format!("{url}?{query}")
    }
}

struct BearerChallenge<'a> {
    realm: &'a str,
    service: &'a str,
}

#[derive(Default)]
struct BearerFields<'a> {
    realm: Option<&'a str>,
    service: Option<&'a str>,
    scope: Option<&'a str>,
}

fn parse_bearer_challenge_header(input: &HeaderValue) -> Option<BearerChallenge<'_>> {
    let fields = parse_bearer_challenge_str(input.to_str().ok()?)?;
    Some(BearerChallenge {
        realm: fields.realm?,
        service: fields.service?,
    })
}

fn parse_bearer_challenge_str(input: &str) -> Option<BearerFields<'_>> {
    use nom::{
        IResult, Parser,
        bytes::{complete::tag, take_until1},
        character::complete::{alpha1, char},
        multi::{many0, many1, separated_list0},
        sequence::{delimited, preceded, separated_pair, terminated},
    };
    fn parser(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
        preceded(
            terminated(tag("Bearer"), many1(tag(" "))),
            separated_list0(
                terminated(tag(","), many0(tag(" "))),
                separated_pair(
                    alpha1,
                    tag("="),
                    delimited(char('"'), take_until1("\""), char('"')),
                ),
            ),
        )
        .parse(input)
    }
    let (_, matches) = parser(input).ok()?;
    let mut ret = BearerFields::default();
    for (k, v) in matches.into_iter() {
        match k {
            "realm" => ret.realm = Some(v),
            "service" => ret.service = Some(v),
            "scope" => ret.scope = Some(v),
            _ => {}
        }
    }
    Some(ret)
}

// quota headers: `100` or `100;w=21600`. Docker hub and github both send
// these on pull endpoints; the sync engine compares remaining against the
// configured minimum before starting a copy.
fn parse_ratelimit_headers(map: &reqwest::header::HeaderMap) -> Option<RateLimit> {
    let value = map
        .get("ratelimit-remaining")
        .or_else(|| map.get("x-ratelimit-remaining"))?;
    parse_ratelimit_remaining_str(value.to_str().ok()?)
}

fn parse_ratelimit_remaining_str(input: &str) -> Option<RateLimit> {
    if let Some((l, r)) = input.split_once(";w=") {
        Some(RateLimit {
            remaining: l.parse().ok()?,
            window: Some(r.parse().ok()?),
        })
    } else {
        Some(RateLimit {
            remaining: input.parse().ok()?,
            window: None,
        })
    }
}
