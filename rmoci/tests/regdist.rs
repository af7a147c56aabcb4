use bytes::Bytes;
use oci_spec::image::{Descriptor, MediaType};

use rmoci::driver::{bytes_stream, stream_to_bytes};
use rmoci::manifest::{MT_OCI_INDEX, MT_OCI_MANIFEST};
use rmoci::{Auth, Error, HostConfig, HostMap, Manifest, Reference, RegClient, RegistryDriver, TlsMode};

const MANIFEST_JSON: &str = r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{"mediaType":"application/vnd.oci.image.config.v1+json","digest":"sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a","size":2},"layers":[]}"#;

fn start_server() -> Option<httpmock::MockServer> {
    match std::panic::catch_unwind(httpmock::MockServer::start) {
        Ok(s) => Some(s),
        Err(_) => {
            eprintln!("skipping registry test: unable to bind mock server in this environment");
            None
        }
    }
}

fn client_for(server: &httpmock::MockServer) -> (RegClient, String) {
    let registry = server.address().to_string();
    let mut hosts = HostMap::new();
    hosts.insert(
        registry.clone(),
        HostConfig {
            auth: Auth::Anonymous,
            tls: TlsMode::Disabled,
        },
    );
    let client = RegClient::builder().hosts(hosts).build().unwrap();
    (client, registry)
}

#[tokio::test]
async fn test_manifest_get_and_head() {
    let Some(server) = start_server() else { return };
    let (client, registry) = client_for(&server);
    let m = Manifest::from_bytes(Some(MT_OCI_MANIFEST), Bytes::from_static(MANIFEST_JSON.as_bytes()))
        .unwrap();
    let dig = m.digest().to_string();

    let get_mock = server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path("/v2/app/manifests/v1");
        then.status(200)
            .header("Content-Type", MT_OCI_MANIFEST)
            .header("Docker-Content-Digest", &dig)
            .body(MANIFEST_JSON);
    });
    let head_mock = server.mock(|when, then| {
        when.method(httpmock::Method::HEAD)
            .path("/v2/app/manifests/v1");
        then.status(200)
            .header("Content-Type", MT_OCI_MANIFEST)
            .header("Docker-Content-Digest", &dig);
    });

    let r = Reference::parse(&format!("{registry}/app:v1")).unwrap();
    let head = client.manifest_head(&r).await.unwrap();
    assert_eq!(head.digest().to_string(), dig);
    assert_eq!(head.media_type().to_string(), MT_OCI_MANIFEST);

    let got = client.manifest_get(&r).await.unwrap();
    assert_eq!(got.raw().as_ref(), MANIFEST_JSON.as_bytes());
    assert_eq!(got.digest().to_string(), dig);

    get_mock.assert_async().await;
    head_mock.assert_async().await;
}

#[tokio::test]
async fn test_manifest_get_digest_mismatch() {
    let Some(server) = start_server() else { return };
    let (client, registry) = client_for(&server);

    // the body does not hash to the digest in the reference
    server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path_includes("/v2/app/manifests/sha256:");
        then.status(200)
            .header("Content-Type", MT_OCI_MANIFEST)
            .body(MANIFEST_JSON);
    });

    let wrong = rmoci::digest::from_data("different bytes").to_string();
    let r = Reference::parse(&format!("{registry}/app@{wrong}")).unwrap();
    assert!(matches!(
        client.manifest_get(&r).await,
        Err(Error::DigestMismatch)
    ));
}

#[tokio::test]
async fn test_manifest_head_without_digest_is_unsupported() {
    let Some(server) = start_server() else { return };
    let (client, registry) = client_for(&server);
    server.mock(|when, then| {
        when.method(httpmock::Method::HEAD)
            .path("/v2/app/manifests/v1");
        then.status(200).header("Content-Type", MT_OCI_MANIFEST);
    });

    let r = Reference::parse(&format!("{registry}/app:v1")).unwrap();
    assert!(matches!(
        client.manifest_head(&r).await,
        Err(Error::UnsupportedApi(_))
    ));
}

#[tokio::test]
async fn test_blob_round_trip() {
    let Some(server) = start_server() else { return };
    let (client, registry) = client_for(&server);
    let data = b"layer bytes";
    let d = Descriptor::new(
        MediaType::ImageLayerGzip,
        data.len() as u64,
        rmoci::digest::from_data(data),
    );

    server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path(format!("/v2/app/blobs/{}", d.digest()));
        then.status(200).body(data);
    });
    let upload_start = server.mock(|when, then| {
        when.method(httpmock::Method::POST)
            .path("/v2/app/blobs/uploads/");
        then.status(202).header("Location", "/v2/app/blobs/uploads/session-1");
    });
    let upload_commit = server.mock(|when, then| {
        when.method(httpmock::Method::PUT)
            .path("/v2/app/blobs/uploads/session-1")
            .query_param("digest", d.digest().to_string());
        then.status(201);
    });

    let r = Reference::parse(&format!("{registry}/app")).unwrap();
    let got = stream_to_bytes(client.blob_get(&r, &d).await.unwrap())
        .await
        .unwrap();
    assert_eq!(got.as_ref(), data);

    let put = client
        .blob_put(&r, Some(&d), bytes_stream(Bytes::from_static(data)))
        .await
        .unwrap();
    assert_eq!(put.digest(), d.digest());
    upload_start.assert_async().await;
    upload_commit.assert_async().await;
}

#[tokio::test]
async fn test_tag_list_sorted() {
    let Some(server) = start_server() else { return };
    let (client, registry) = client_for(&server);
    server.mock(|when, then| {
        when.method(httpmock::Method::GET).path("/v2/app/tags/list");
        then.status(200)
            .header("Content-Type", "application/json")
            .body(r#"{"name":"app","tags":["v3","v1","v2"]}"#);
    });

    let r = Reference::parse(&format!("{registry}/app")).unwrap();
    assert_eq!(client.tag_list(&r).await.unwrap(), vec!["v1", "v2", "v3"]);
}

#[tokio::test]
async fn test_repo_list_pagination() {
    let Some(server) = start_server() else { return };
    let (client, registry) = client_for(&server);
    server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path("/v2/_catalog")
            .query_param("last", "b");
        then.status(200)
            .header("Content-Type", "application/json")
            .body(r#"{"repositories":[]}"#);
    });
    server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path("/v2/_catalog")
            .query_param_missing("last");
        then.status(200)
            .header("Content-Type", "application/json")
            .body(r#"{"repositories":["a","b"]}"#);
    });

    let r = Reference::parse(&registry).unwrap();
    let first = client.repo_list(&r, None).await.unwrap();
    assert_eq!(first, vec!["a", "b"]);
    let next = client.repo_list(&r, Some("b")).await.unwrap();
    assert!(next.is_empty());
}

#[tokio::test]
async fn test_referrer_list_api_and_filter() {
    let Some(server) = start_server() else { return };
    let (client, registry) = client_for(&server);
    let subject = rmoci::digest::from_data("subject").to_string();
    let body = format!(
        r#"{{"schemaVersion":2,"mediaType":"{MT_OCI_INDEX}","manifests":[
            {{"mediaType":"{MT_OCI_MANIFEST}","digest":"{}","size":100,"artifactType":"application/example.sbom"}},
            {{"mediaType":"{MT_OCI_MANIFEST}","digest":"{}","size":101,"artifactType":"application/example.signature"}}
        ]}}"#,
        rmoci::digest::from_data("sbom"),
        rmoci::digest::from_data("sig"),
    );
    server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path(format!("/v2/app/referrers/{subject}"));
        then.status(200)
            .header("Content-Type", MT_OCI_INDEX)
            .body(&body);
    });

    let r = Reference::parse(&format!("{registry}/app@{subject}")).unwrap();
    let all = client.referrer_list(&r, &[]).await.unwrap();
    assert_eq!(all.len(), 2);

    let filter = rmoci::ReferrerFilter {
        artifact_type: Some("application/example.sbom".to_string()),
        ..Default::default()
    };
    let filtered = client.referrer_list(&r, &[filter]).await.unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(
        filtered[0].digest().to_string(),
        rmoci::digest::from_data("sbom").to_string()
    );
}

#[tokio::test]
async fn test_referrer_list_falls_back_to_tag() {
    let Some(server) = start_server() else { return };
    let (client, registry) = client_for(&server);
    let subject = rmoci::digest::from_data("subject").to_string();
    let hex64 = subject.strip_prefix("sha256:").unwrap();

    server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path(format!("/v2/app/referrers/{subject}"));
        then.status(404);
    });
    let body = format!(
        r#"{{"schemaVersion":2,"mediaType":"{MT_OCI_INDEX}","manifests":[
            {{"mediaType":"{MT_OCI_MANIFEST}","digest":"{}","size":100,"artifactType":"application/example.sbom"}}
        ]}}"#,
        rmoci::digest::from_data("sbom"),
    );
    let dig = rmoci::digest::from_data(body.as_bytes()).to_string();
    server.mock(|when, then| {
        when.method(httpmock::Method::GET)
            .path(format!("/v2/app/manifests/sha256-{hex64}"));
        then.status(200)
            .header("Content-Type", MT_OCI_INDEX)
            .header("Docker-Content-Digest", &dig)
            .body(&body);
    });

    let r = Reference::parse(&format!("{registry}/app@{subject}")).unwrap();
    let listed = client.referrer_list(&r, &[]).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn test_manifest_put() {
    let Some(server) = start_server() else { return };
    let (client, registry) = client_for(&server);
    let m = Manifest::from_bytes(Some(MT_OCI_MANIFEST), Bytes::from_static(MANIFEST_JSON.as_bytes()))
        .unwrap();

    let put_mock = server.mock(|when, then| {
        when.method(httpmock::Method::PUT)
            .path("/v2/app/manifests/v1")
            .header("Content-Type", MT_OCI_MANIFEST)
            .body(MANIFEST_JSON);
        then.status(201);
    });

    let r = Reference::parse(&format!("{registry}/app:v1")).unwrap();
    client.manifest_put(&r, &m, false).await.unwrap();
    put_mock.assert_async().await;
}
