//! Transport over a fetch-like primitive provided by an embedding host.
//!
//! Hosts such as a browser or a scripting runtime usually own the network
//! stack. They expose it as a single `fetch(method, url, headers, body)`
//! call that resolves to a fully buffered response, and [`HostFetch`]
//! models exactly that. Cookies and other ambient credentials are always
//! included.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::{Body, Request, Response, Transport};
use crate::error::{OciError, Result};

/// A request handed to the host.
#[derive(Debug, Clone)]
pub struct HostRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Mirrors `credentials: "include"`: the host attaches its own cookies
    /// and auth state.
    pub include_credentials: bool,
}

/// A buffered response returned by the host.
#[derive(Debug, Clone)]
pub struct HostResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// The host's fetch primitive.
///
/// An `Err` means the request never produced a response (network failure,
/// CORS rejection, ...). Non-2xx responses must be returned as `Ok`.
#[async_trait::async_trait]
pub trait HostFetch: Send + Sync {
    async fn fetch(&self, request: HostRequest) -> std::result::Result<HostResponse, String>;
}

/// [`Transport`] implementation that forwards every request to a
/// [`HostFetch`].
pub struct HostBridgeTransport<F> {
    host: F,
}

impl<F: HostFetch> HostBridgeTransport<F> {
    pub fn new(host: F) -> Self {
        Self { host }
    }
}

#[async_trait::async_trait]
impl<F: HostFetch> Transport for HostBridgeTransport<F> {
    async fn send(&self, request: Request) -> Result<Response> {
        let url = request.url.to_string();
        let host_request = HostRequest {
            method: request.method.as_str().to_string(),
            url: url.clone(),
            headers: request
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
            body: request.body.map(|b| b.to_vec()),
            include_credentials: true,
        };

        let host_response = self.host.fetch(host_request).await.map_err(|e| {
            OciError::RegistryUnavailable(format!("host fetch of {} failed: {}", url, e))
        })?;

        let status = StatusCode::from_u16(host_response.status).map_err(|_| {
            OciError::RegistryUnavailable(format!(
                "host returned invalid status {} for {}",
                host_response.status, url
            ))
        })?;
        if !status.is_success() {
            debug!(%url, %status, status_text = %host_response.status_text, "host fetch returned error status");
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &host_response.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => warn!(header = %name, "dropping malformed header from host response"),
            }
        }

        Ok(Response {
            status,
            headers,
            body: Body::from_bytes(host_response.body),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
