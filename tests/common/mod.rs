//! In-process fake OCI registry shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::stream;
use pullbox_oci::blob::sha256_digest;
use pullbox_oci::transport::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use pullbox_oci::transport::StatusCode;
use pullbox_oci::{Body, Request, Response, Transport};

pub const REGISTRY: &str = "registry.test";
pub const MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
pub const LAYER_TYPE: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// `Authorization` value for `user` / `pass`.
pub const BASIC_USER_PASS: &str = "Basic dXNlcjpwYXNz";

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// A synthetic image: config, layers, and the manifest tying them together.
#[derive(Clone)]
pub struct FakeImage {
    pub config: Vec<u8>,
    pub config_digest: String,
    pub layers: Vec<Vec<u8>>,
    pub manifest: Vec<u8>,
    pub manifest_digest: String,
}

impl FakeImage {
    pub fn new(layers: &[Vec<u8>]) -> Self {
        let diff_ids: Vec<String> = layers
            .iter()
            .enumerate()
            .map(|(i, _)| format!("sha256:{:064x}", i))
            .collect();
        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": diff_ids},
        }))
        .unwrap();
        let config_digest = sha256_digest(&config);

        let layer_descs: Vec<serde_json::Value> = layers
            .iter()
            .map(|l| {
                serde_json::json!({
                    "mediaType": LAYER_TYPE,
                    "digest": sha256_digest(l),
                    "size": l.len(),
                })
            })
            .collect();
        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_TYPE,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": layer_descs,
        }))
        .unwrap();
        let manifest_digest = sha256_digest(&manifest);

        Self {
            config,
            config_digest,
            layers: layers.to_vec(),
            manifest,
            manifest_digest,
        }
    }

    /// Three layers of assorted sizes, the largest spanning many chunks.
    pub fn sample() -> Self {
        Self::new(&[
            pattern(3_000, 1),
            pattern(10, 2),
            pattern(70_000, 3),
        ])
    }

    pub fn layer_digest(&self, i: usize) -> String {
        sha256_digest(&self.layers[i])
    }

    /// Sum of unique layer sizes.
    pub fn total_size(&self) -> u64 {
        let mut seen = HashSet::new();
        self.layers
            .iter()
            .filter(|l| seen.insert(sha256_digest(l)))
            .map(|l| l.len() as u64)
            .sum()
    }
}

/// Deterministic filler bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// How the fake registry guards its endpoints.
#[derive(Clone)]
pub enum AuthMode {
    Open,
    /// Token flow. With `credentials`, the token endpoint demands that
    /// basic `Authorization` value.
    Bearer {
        token: String,
        credentials: Option<String>,
    },
    /// Plain basic auth on every endpoint.
    Basic { credentials: String },
}

/// A registry serving images from memory through the [`Transport`] trait.
pub struct FakeRegistry {
    auth: AuthMode,
    chunk: usize,
    manifests: Mutex<HashMap<(String, String), Vec<u8>>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    truncated: Mutex<HashMap<String, usize>>,
    retag: Mutex<Option<(String, String, FakeImage)>>,
    calls: AtomicUsize,
    paths: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn new(auth: AuthMode) -> Self {
        Self {
            auth,
            chunk: 4096,
            manifests: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            truncated: Mutex::new(HashMap::new()),
            retag: Mutex::new(None),
            calls: AtomicUsize::new(0),
            paths: Mutex::new(Vec::new()),
        }
    }

    pub fn open() -> Self {
        Self::new(AuthMode::Open)
    }

    /// Serve bodies in chunks of `chunk` bytes.
    pub fn chunked(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }

    /// Publish `image` as `repository:tag` (and by digest).
    pub fn push(&self, repository: &str, tag: &str, image: &FakeImage) {
        let mut manifests = self.manifests.lock().unwrap();
        manifests.insert((repository.to_string(), tag.to_string()), image.manifest.clone());
        manifests.insert(
            (repository.to_string(), image.manifest_digest.clone()),
            image.manifest.clone(),
        );
        let mut blobs = self.blobs.lock().unwrap();
        blobs.insert(image.config_digest.clone(), image.config.clone());
        for layer in &image.layers {
            blobs.insert(sha256_digest(layer), layer.clone());
        }
    }

    /// Cut the blob `digest` off after `len` bytes.
    pub fn truncate_blob(&self, digest: &str, len: usize) {
        self.truncated.lock().unwrap().insert(digest.to_string(), len);
    }

    /// Replace the content of blob `digest`, keeping its length.
    pub fn corrupt_blob(&self, digest: &str) {
        if let Some(data) = self.blobs.lock().unwrap().get_mut(digest) {
            for b in data.iter_mut() {
                *b = !*b;
            }
        }
    }

    /// After the first manifest request for `repository:tag`, point the tag
    /// at `image` instead.
    pub fn retag_after_first_fetch(&self, repository: &str, tag: &str, image: &FakeImage) {
        *self.retag.lock().unwrap() = Some((repository.to_string(), tag.to_string(), image.clone()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }

    fn authorized(&self, header: Option<&str>) -> Option<Response> {
        match &self.auth {
            AuthMode::Open => None,
            AuthMode::Bearer { token, .. } => {
                if header == Some(format!("Bearer {}", token).as_str()) {
                    return None;
                }
                let challenge = format!(
                    r#"Bearer realm="https://{}/token",service="{}""#,
                    REGISTRY, REGISTRY
                );
                Some(unauthorized(&challenge))
            }
            AuthMode::Basic { credentials } => {
                if header == Some(credentials.as_str()) {
                    return None;
                }
                Some(unauthorized(r#"Basic realm="registry.test""#))
            }
        }
    }

    fn token(&self, header: Option<&str>) -> Response {
        match &self.auth {
            AuthMode::Bearer { token, credentials } => {
                if let Some(expected) = credentials {
                    if header != Some(expected.as_str()) {
                        return status(StatusCode::UNAUTHORIZED);
                    }
                }
                let body = serde_json::to_vec(&serde_json::json!({ "token": token })).unwrap();
                self.respond(body, None)
            }
            _ => status(StatusCode::NOT_FOUND),
        }
    }

    fn manifest(&self, repository: &str, reference: &str) -> Response {
        let key = (repository.to_string(), reference.to_string());
        let body = self.manifests.lock().unwrap().get(&key).cloned();
        let Some(body) = body else {
            return status(StatusCode::NOT_FOUND);
        };

        let swap = {
            let mut retag = self.retag.lock().unwrap();
            let due =
                matches!(&*retag, Some((repo, tag, _)) if repo == repository && tag == reference);
            if due {
                retag.take()
            } else {
                None
            }
        };
        if let Some((repo, tag, image)) = swap {
            self.push(&repo, &tag, &image);
        }

        self.respond(body, Some(MANIFEST_TYPE))
    }

    fn blob(&self, digest: &str) -> Response {
        let Some(mut body) = self.blobs.lock().unwrap().get(digest).cloned() else {
            return status(StatusCode::NOT_FOUND);
        };
        if let Some(len) = self.truncated.lock().unwrap().get(digest) {
            body.truncate(*len);
        }
        self.respond(body, Some("application/octet-stream"))
    }

    fn respond(&self, body: Vec<u8>, content_type: Option<&str>) -> Response {
        let chunks: Vec<pullbox_oci::Result<Bytes>> = body
            .chunks(self.chunk.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let mut resp = Response::new(StatusCode::OK, Body::from_stream(stream::iter(chunks)));
        if let Some(ct) = content_type {
            resp.headers
                .insert(CONTENT_TYPE, HeaderValue::from_str(ct).unwrap());
        }
        resp
    }
}

#[async_trait::async_trait]
impl Transport for FakeRegistry {
    async fn send(&self, request: Request) -> pullbox_oci::Result<Response> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = request.url.path().to_string();
        self.paths.lock().unwrap().push(path.clone());

        let auth = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        if path == "/token" {
            return Ok(self.token(auth));
        }
        if let Some(denied) = self.authorized(auth) {
            return Ok(denied);
        }

        let Some(rest) = path.strip_prefix("/v2/") else {
            return Ok(status(StatusCode::NOT_FOUND));
        };
        if let Some((repository, reference)) = rest.split_once("/manifests/") {
            return Ok(self.manifest(repository, reference));
        }
        if let Some((_, digest)) = rest.split_once("/blobs/") {
            return Ok(self.blob(digest));
        }
        Ok(status(StatusCode::NOT_FOUND))
    }
}

fn status(code: StatusCode) -> Response {
    Response::new(code, Body::empty())
}

fn unauthorized(challenge: &str) -> Response {
    let mut resp = status(StatusCode::UNAUTHORIZED);
    resp.headers
        .insert(WWW_AUTHENTICATE, HeaderValue::from_str(challenge).unwrap());
    resp
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Records every `(transferred, total)` update.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<(u64, u64)>>>,
}

impl Recorder {
    pub fn updates(&self) -> Vec<(u64, u64)> {
        self.seen.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<(u64, u64)> {
        self.seen.lock().unwrap().last().copied()
    }
}

impl pullbox_oci::ProgressSink for Recorder {
    fn update(&self, transferred: u64, total: u64) {
        self.seen.lock().unwrap().push((transferred, total));
    }
}
