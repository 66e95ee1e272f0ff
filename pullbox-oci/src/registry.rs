use std::sync::{Arc, Mutex};

use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info};

use crate::auth::{Authenticator, Challenge};
use crate::blob::{sha256_digest, VerifiedBody};
use crate::error::{OciError, Result};
use crate::manifest::{
    is_manifest_media_type, Descriptor, ManifestResponse, OciManifest, Platform,
    MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST,
};
use crate::reference::ImageRef;
use crate::transport::{Request, Response, Transport};

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// OCI Distribution client for a single pull.
///
/// Bearer tokens obtained during the pull are cached on the client, so build
/// a fresh client per invocation.
pub struct RegistryClient {
    transport: Arc<dyn Transport>,
    auth: Authenticator,
    token: Mutex<Option<String>>,
}

/// A single-platform manifest together with the digest of its exact bytes.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: OciManifest,
    pub digest: String,
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
pub fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

impl RegistryClient {
    pub fn new(transport: Arc<dyn Transport>, auth: Authenticator) -> Self {
        Self {
            transport,
            auth,
            token: Mutex::new(None),
        }
    }

    // -- public API ---------------------------------------------------------

    /// Fetch the manifest (or image index) for `image_ref`, returning it with
    /// the digest of the bytes the registry served.
    pub async fn fetch_manifest(&self, image_ref: &ImageRef) -> Result<(ManifestResponse, String)> {
        let accept = [
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");

        let (body, content_type) = self
            .fetch_manifest_bytes(image_ref, &image_ref.reference, &accept)
            .await?;
        let digest = sha256_digest(&body);
        if image_ref.is_digest() {
            check_manifest_digest(&image_ref.reference, &digest)?;
        }

        let response = ManifestResponse::parse(&body, content_type.as_deref())?;
        Ok((response, digest))
    }

    /// Fetch a single manifest by its digest (used after resolving an index,
    /// and to re-fetch a pinned image). The served bytes must hash to
    /// `digest`.
    pub async fn fetch_manifest_by_digest(
        &self,
        image_ref: &ImageRef,
        digest: &str,
    ) -> Result<ResolvedManifest> {
        let accept = [MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST].join(", ");

        let (body, content_type) = self.fetch_manifest_bytes(image_ref, digest, &accept).await?;
        check_manifest_digest(digest, &sha256_digest(&body))?;

        match ManifestResponse::parse(&body, content_type.as_deref())? {
            ManifestResponse::Manifest(manifest) => Ok(ResolvedManifest {
                manifest: check_manifest_media_type(manifest)?,
                digest: digest.to_string(),
            }),
            ManifestResponse::Index(_) => Err(OciError::ManifestInconsistency(format!(
                "{} is an image index, expected an image manifest",
                digest
            ))),
        }
    }

    /// Resolve an image reference to a concrete [`OciManifest`] by first
    /// fetching the manifest (which may be an index) and selecting the
    /// platform-appropriate entry if needed.
    pub async fn resolve_manifest(
        &self,
        image_ref: &ImageRef,
        platform: &Platform,
    ) -> Result<ResolvedManifest> {
        match self.fetch_manifest(image_ref).await? {
            (ManifestResponse::Manifest(manifest), digest) => Ok(ResolvedManifest {
                manifest: check_manifest_media_type(manifest)?,
                digest,
            }),
            (ManifestResponse::Index(idx), _) => {
                let desc = idx.select_platform(platform)?;
                info!(digest = %desc.digest, "resolved platform {}", platform);
                self.fetch_manifest_by_digest(image_ref, &desc.digest).await
            }
        }
    }

    /// Open a streaming download of the blob described by `desc`. The
    /// returned body enforces the declared size and digest.
    pub async fn open_blob(&self, image_ref: &ImageRef, desc: &Descriptor) -> Result<VerifiedBody> {
        let size = desc.declared_size()?;
        let url = self.url(image_ref, &format!("blobs/{}", desc.digest))?;

        debug!(digest = %desc.digest, size, "opening blob");
        let resp = self.authenticated_get(&url, image_ref, None).await?;
        Ok(VerifiedBody::new(resp.body, desc.digest.clone(), size))
    }

    /// Download a small blob (such as the image config) into memory.
    pub async fn fetch_blob(&self, image_ref: &ImageRef, desc: &Descriptor) -> Result<Vec<u8>> {
        self.open_blob(image_ref, desc).await?.bytes().await
    }

    // -- internals ----------------------------------------------------------

    fn url(&self, image_ref: &ImageRef, path: &str) -> Result<Url> {
        let raw = format!(
            "{}://{}/v2/{}/{}",
            registry_scheme(&image_ref.registry),
            image_ref.registry,
            image_ref.repository,
            path,
        );
        Url::parse(&raw).map_err(|e| {
            OciError::invalid_reference(&image_ref.to_string(), format!("bad registry URL: {}", e))
        })
    }

    async fn fetch_manifest_bytes(
        &self,
        image_ref: &ImageRef,
        reference: &str,
        accept: &str,
    ) -> Result<(Vec<u8>, Option<String>)> {
        let url = self.url(image_ref, &format!("manifests/{}", reference))?;
        let resp = self.authenticated_get(&url, image_ref, Some(accept)).await?;
        let content_type = resp.header_str(&CONTENT_TYPE).map(str::to_string);
        let body = resp.body.bytes().await?;
        Ok((body, content_type))
    }

    fn cached_token(&self) -> Option<String> {
        self.token.lock().ok().and_then(|t| t.clone())
    }

    fn store_token(&self, token: &str) {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token.to_string());
        }
    }

    /// Perform a GET, answering a `401` challenge once with either a bearer
    /// token or basic credentials.
    async fn authenticated_get(
        &self,
        url: &Url,
        image_ref: &ImageRef,
        accept: Option<&str>,
    ) -> Result<Response> {
        let first_auth = self.cached_token().map(|t| format!("Bearer {}", t));
        let resp = self
            .transport
            .send(build_get(url, accept, first_auth.as_deref())?)
            .await?;

        if resp.status != StatusCode::UNAUTHORIZED {
            return check_status(resp, url).await;
        }

        let challenge = resp.header_str(&WWW_AUTHENTICATE).map(str::to_string);
        drop(resp);

        let authorization = match challenge.as_deref().and_then(Challenge::parse) {
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let token = self
                    .fetch_bearer_token(&realm, service.as_deref(), scope, image_ref)
                    .await?;
                self.store_token(&token);
                format!("Bearer {}", token)
            }
            Some(Challenge::Basic) => self.auth.basic_header().ok_or_else(|| {
                OciError::Auth(format!("{} requires credentials", image_ref.registry))
            })?,
            None => {
                return Err(OciError::Auth(format!(
                    "GET {} returned 401 without a usable challenge ({:?})",
                    url, challenge
                )))
            }
        };

        let resp = self
            .transport
            .send(build_get(url, accept, Some(&authorization))?)
            .await?;
        check_status(resp, url).await
    }

    /// Fetch a token from the challenge realm, presenting basic credentials
    /// when configured and anonymously otherwise.
    async fn fetch_bearer_token(
        &self,
        realm: &str,
        service: Option<&str>,
        scope: Option<String>,
        image_ref: &ImageRef,
    ) -> Result<String> {
        let scope = scope.unwrap_or_else(|| format!("repository:{}:pull", image_ref.repository));
        let mut token_url = Url::parse(realm)
            .map_err(|e| OciError::Auth(format!("invalid token realm {:?}: {}", realm, e)))?;
        {
            let mut query = token_url.query_pairs_mut();
            if let Some(service) = service {
                query.append_pair("service", service);
            }
            query.append_pair("scope", &scope);
        }
        debug!(%token_url, anonymous = self.auth.is_anonymous(), "fetching bearer token");

        let basic = self.auth.basic_header();
        let resp = self
            .transport
            .send(build_get(&token_url, None, basic.as_deref())?)
            .await?;

        if resp.status == StatusCode::UNAUTHORIZED || resp.status == StatusCode::FORBIDDEN {
            return Err(OciError::Auth(format!(
                "token endpoint rejected the request: {}",
                resp.status
            )));
        }
        if !resp.status.is_success() {
            let status = resp.status;
            let body = resp.body.text().await;
            return Err(OciError::RegistryUnavailable(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body = resp.body.bytes().await?;
        let parsed: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| OciError::Auth(format!("invalid token response: {}", e)))?;
        parsed
            .token
            .or(parsed.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| OciError::Auth("token response missing token field".to_string()))
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn build_get(url: &Url, accept: Option<&str>, authorization: Option<&str>) -> Result<Request> {
    let mut req = Request::get(url.clone());
    if let Some(accept) = accept {
        req = req.header(ACCEPT, header_value(accept)?);
    }
    if let Some(authorization) = authorization {
        req = req.header(AUTHORIZATION, header_value(authorization)?);
    }
    Ok(req)
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| OciError::Auth("credential contains characters not allowed in a header".to_string()))
}

/// Map a final response status onto the error taxonomy.
async fn check_status(resp: Response, url: &Url) -> Result<Response> {
    let status = resp.status;
    if status.is_success() {
        return Ok(resp);
    }
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(OciError::Auth(format!("GET {} returned {}", url, status)))
        }
        StatusCode::NOT_FOUND => Err(OciError::NotFound(url.to_string())),
        _ => {
            let body = resp.body.text().await;
            Err(OciError::RegistryUnavailable(format!(
                "GET {} returned {}: {}",
                url, status, body
            )))
        }
    }
}

fn check_manifest_digest(expected: &str, actual: &str) -> Result<()> {
    // Only sha256 manifests can be checked locally.
    if expected.starts_with("sha256:") && expected != actual {
        return Err(OciError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn check_manifest_media_type(manifest: OciManifest) -> Result<OciManifest> {
    if manifest.media_type.is_empty() || is_manifest_media_type(&manifest.media_type) {
        Ok(manifest)
    } else {
        Err(OciError::UnsupportedMediaType(manifest.media_type))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Body;
    use crate::ErrorKind;
    use secrecy::SecretString;
    use std::collections::VecDeque;

    /// Replays canned responses in order and records each request.
    struct Scripted {
        replies: Mutex<VecDeque<(u16, Vec<(&'static str, String)>, Vec<u8>)>>,
        seen: Mutex<Vec<Request>>,
    }

    impl Scripted {
        fn new(replies: Vec<(u16, Vec<(&'static str, String)>, Vec<u8>)>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<Request> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for Scripted {
        async fn send(&self, request: Request) -> Result<Response> {
            self.seen.lock().unwrap().push(request);
            let (status, headers, body) = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected extra request");
            let mut resp = Response::new(StatusCode::from_u16(status).unwrap(), Body::from_bytes(body));
            for (name, value) in headers {
                resp.headers.insert(name, HeaderValue::from_str(&value).unwrap());
            }
            Ok(resp)
        }
    }

    const MANIFEST: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:aa", "size": 2},
        "layers": []
    }"#;

    fn image() -> ImageRef {
        ImageRef::parse("registry.example.com/team/app:v1").unwrap()
    }

    fn bearer_challenge() -> (u16, Vec<(&'static str, String)>, Vec<u8>) {
        (
            401,
            vec![(
                "www-authenticate",
                r#"Bearer realm="https://auth.example.com/token",service="registry.example.com""#
                    .to_string(),
            )],
            Vec::new(),
        )
    }

    #[test]
    fn registry_scheme_localhost_is_http() {
        assert_eq!(registry_scheme("localhost:5555"), "http");
        assert_eq!(registry_scheme("localhost:5000"), "http");
        assert_eq!(registry_scheme("localhost"), "http");
        assert_eq!(registry_scheme("127.0.0.1:5000"), "http");
    }

    #[test]
    fn registry_scheme_remote_is_https() {
        assert_eq!(registry_scheme("ghcr.io"), "https");
        assert_eq!(registry_scheme("registry-1.docker.io"), "https");
        assert_eq!(registry_scheme("my.registry.io:443"), "https");
    }

    #[tokio::test]
    async fn anonymous_bearer_flow() {
        let transport = Scripted::new(vec![
            bearer_challenge(),
            (200, vec![], br#"{"token": "tok-1"}"#.to_vec()),
            (200, vec![], MANIFEST.as_bytes().to_vec()),
        ]);
        let client = RegistryClient::new(transport.clone(), Authenticator::Anonymous);

        let resolved = client.resolve_manifest(&image(), &Platform::host()).await.unwrap();
        assert_eq!(resolved.digest, sha256_digest(MANIFEST.as_bytes()));

        let reqs = transport.requests();
        assert_eq!(reqs.len(), 3);
        assert_eq!(
            reqs[0].url.as_str(),
            "https://registry.example.com/v2/team/app/manifests/v1"
        );
        assert!(reqs[0].headers.get(AUTHORIZATION).is_none());

        let token_url = &reqs[1].url;
        assert_eq!(token_url.host_str(), Some("auth.example.com"));
        let query: Vec<(String, String)> = token_url.query_pairs().into_owned().collect();
        assert!(query.contains(&("service".to_string(), "registry.example.com".to_string())));
        assert!(query.contains(&("scope".to_string(), "repository:team/app:pull".to_string())));
        assert!(reqs[1].headers.get(AUTHORIZATION).is_none());

        assert_eq!(reqs[2].headers[AUTHORIZATION], "Bearer tok-1");
    }

    #[tokio::test]
    async fn token_is_reused_for_later_requests() {
        let transport = Scripted::new(vec![
            bearer_challenge(),
            (200, vec![], br#"{"access_token": "tok-2"}"#.to_vec()),
            (200, vec![], MANIFEST.as_bytes().to_vec()),
            (200, vec![], b"{}".to_vec()),
        ]);
        let client = RegistryClient::new(transport.clone(), Authenticator::Anonymous);

        let resolved = client.resolve_manifest(&image(), &Platform::host()).await.unwrap();
        let config = client
            .fetch_blob(&image(), &resolved.manifest.config)
            .await
            .unwrap_err();
        // "{}" does not hash to "sha256:aa"; what matters is the header.
        assert_eq!(config.kind(), ErrorKind::DigestMismatch);

        let reqs = transport.requests();
        assert_eq!(reqs.len(), 4);
        assert_eq!(reqs[3].headers[AUTHORIZATION], "Bearer tok-2");
        assert!(reqs[3].url.path().ends_with("/blobs/sha256:aa"));
    }

    #[tokio::test]
    async fn basic_credentials_go_to_token_endpoint() {
        let transport = Scripted::new(vec![
            bearer_challenge(),
            (200, vec![], br#"{"token": "tok-3"}"#.to_vec()),
            (200, vec![], MANIFEST.as_bytes().to_vec()),
        ]);
        let pass = SecretString::from("pass".to_string());
        let auth = Authenticator::from_credentials(Some("user"), Some(&pass));
        let client = RegistryClient::new(transport.clone(), auth);

        client.resolve_manifest(&image(), &Platform::host()).await.unwrap();
        let reqs = transport.requests();
        assert_eq!(reqs[1].headers[AUTHORIZATION], "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn basic_challenge_uses_credentials() {
        let transport = Scripted::new(vec![
            (401, vec![("www-authenticate", r#"Basic realm="x""#.to_string())], Vec::new()),
            (200, vec![], MANIFEST.as_bytes().to_vec()),
        ]);
        let pass = SecretString::from("pass".to_string());
        let auth = Authenticator::from_credentials(Some("user"), Some(&pass));
        let client = RegistryClient::new(transport.clone(), auth);

        client.resolve_manifest(&image(), &Platform::host()).await.unwrap();
        assert_eq!(transport.requests()[1].headers[AUTHORIZATION], "Basic dXNlcjpwYXNz");
    }

    #[tokio::test]
    async fn basic_challenge_without_credentials_is_auth_error() {
        let transport = Scripted::new(vec![(
            401,
            vec![("www-authenticate", r#"Basic realm="x""#.to_string())],
            Vec::new(),
        )]);
        let client = RegistryClient::new(transport, Authenticator::Anonymous);
        let err = client.resolve_manifest(&image(), &Platform::host()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthError);
    }

    #[tokio::test]
    async fn rejected_token_is_auth_error() {
        let transport = Scripted::new(vec![bearer_challenge(), (401, vec![], Vec::new())]);
        let client = RegistryClient::new(transport, Authenticator::Anonymous);
        let err = client.resolve_manifest(&image(), &Platform::host()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthError);
    }

    #[tokio::test]
    async fn unauthorized_after_retry_is_auth_error() {
        let transport = Scripted::new(vec![
            bearer_challenge(),
            (200, vec![], br#"{"token": "t"}"#.to_vec()),
            (403, vec![], Vec::new()),
        ]);
        let client = RegistryClient::new(transport, Authenticator::Anonymous);
        let err = client.resolve_manifest(&image(), &Platform::host()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthError);
    }

    #[tokio::test]
    async fn missing_manifest_is_not_found() {
        let transport = Scripted::new(vec![(404, vec![], b"{}".to_vec())]);
        let client = RegistryClient::new(transport, Authenticator::Anonymous);
        let err = client.resolve_manifest(&image(), &Platform::host()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn server_error_is_unavailable() {
        let transport = Scripted::new(vec![(503, vec![], b"maintenance".to_vec())]);
        let client = RegistryClient::new(transport, Authenticator::Anonymous);
        let err = client.resolve_manifest(&image(), &Platform::host()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RegistryUnavailable);
        assert!(err.to_string().contains("maintenance"));
    }

    #[tokio::test]
    async fn index_resolves_to_platform_manifest() {
        let platform = Platform::host();
        let manifest_digest = sha256_digest(MANIFEST.as_bytes());
        let index = format!(
            r#"{{"schemaVersion": 2, "mediaType": "{}", "manifests": [
                {{"mediaType": "{}", "digest": "{}", "size": {}, "platform": {{"architecture": "{}", "os": "linux"}}}}
            ]}}"#,
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_OCI_MANIFEST,
            manifest_digest,
            MANIFEST.len(),
            platform.architecture
        );
        let transport = Scripted::new(vec![
            (200, vec![], index.into_bytes()),
            (200, vec![], MANIFEST.as_bytes().to_vec()),
        ]);
        let client = RegistryClient::new(transport.clone(), Authenticator::Anonymous);

        let resolved = client.resolve_manifest(&image(), &platform).await.unwrap();
        assert_eq!(resolved.digest, manifest_digest);
        assert!(transport.requests()[1]
            .url
            .path()
            .ends_with(&format!("/manifests/{}", manifest_digest)));
    }

    #[tokio::test]
    async fn tampered_manifest_is_digest_mismatch() {
        let pinned = image().pinned(&sha256_digest(b"something else"));
        let transport = Scripted::new(vec![(200, vec![], MANIFEST.as_bytes().to_vec())]);
        let client = RegistryClient::new(transport, Authenticator::Anonymous);
        let err = client
            .fetch_manifest_by_digest(&pinned, &pinned.reference)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DigestMismatch);
    }
}
