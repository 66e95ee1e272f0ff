use futures_util::TryStreamExt;
use tracing::debug;

use super::{Body, Request, Response, Transport};
use crate::error::{OciError, Result};

/// Transport backed by a `reqwest` connection pool.
///
/// Cloning is cheap and clones share the pool, so concurrent pulls can reuse
/// connections without sharing any other state.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pullbox-oci/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| {
                OciError::RegistryUnavailable(format!("failed to build HTTP client: {}", e))
            })?;
        Ok(Self { client })
    }

    /// Wrap an already configured client (proxies, custom roots, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        debug!(method = %request.method, url = %request.url, "sending request");

        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = Body::from_stream(resp.bytes_stream().map_err(OciError::from));

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}
