//! Byte-level progress metering for blob downloads.
//!
//! [`ProgressTransport`] wraps any [`Transport`] and meters every response
//! body fetched from a registry blob endpoint. Progress is a by-product of
//! reading: bytes count only once the caller actually pulls them out of the
//! body.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::Result;
use crate::transport::{Body, Request, Response, Transport};

/// Receives progress updates. Implemented for any `Fn(transferred, total)`.
pub trait ProgressSink: Send + Sync {
    fn update(&self, transferred: u64, total: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn update(&self, transferred: u64, total: u64) {
        self(transferred, total)
    }
}

/// A sink that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _transferred: u64, _total: u64) {}
}

/// Shared counters for one image download.
#[derive(Debug)]
pub struct ProgressState {
    total: u64,
    transferred: AtomicU64,
}

impl ProgressState {
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }
}

/// Handle to a [`ProgressState`] plus the sink that presents it.
///
/// Build one per image; the total must be known up front.
#[derive(Clone)]
pub struct ProgressMeter {
    state: Arc<ProgressState>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressMeter {
    pub fn new(total: u64, sink: Arc<dyn ProgressSink>) -> Self {
        sink.update(0, total);
        Self {
            state: Arc::new(ProgressState {
                total,
                transferred: AtomicU64::new(0),
            }),
            sink,
        }
    }

    pub fn total(&self) -> u64 {
        self.state.total()
    }

    pub fn transferred(&self) -> u64 {
        self.state.transferred()
    }

    fn advance(&self, n: u64) {
        let now = self.state.transferred.fetch_add(n, Ordering::AcqRel) + n;
        self.sink.update(now, self.state.total);
    }
}

impl std::fmt::Debug for ProgressMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressMeter")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ProgressTransport
// ---------------------------------------------------------------------------

/// Decorates a transport so that blob response bodies feed a
/// [`ProgressMeter`]. All other requests pass through untouched.
pub struct ProgressTransport<T> {
    inner: T,
    meter: ProgressMeter,
}

impl<T: Transport> ProgressTransport<T> {
    pub fn new(inner: T, meter: ProgressMeter) -> Self {
        Self { inner, meter }
    }
}

/// Whether `path` addresses the registry blob endpoint
/// (`/v2/<name>/blobs/<digest>`).
pub fn is_blob_path(path: &str) -> bool {
    path.contains("/blobs/")
}

#[async_trait::async_trait]
impl<T: Transport> Transport for ProgressTransport<T> {
    async fn send(&self, request: Request) -> Result<Response> {
        let metered = is_blob_path(request.url.path());
        let response = self.inner.send(request).await?;
        if !metered {
            return Ok(response);
        }

        Ok(Response {
            body: Body::from_stream(ProgressBody {
                inner: response.body,
                meter: self.meter.clone(),
            }),
            ..response
        })
    }
}

/// A body that reports every chunk to the meter before handing it on.
struct ProgressBody {
    inner: Body,
    meter: ProgressMeter,
}

impl Stream for ProgressBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let item = ready!(self.inner.poll_next_unpin(cx));
        if let Some(Ok(chunk)) = &item {
            self.meter.advance(chunk.len() as u64);
        }
        Poll::Ready(item)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
