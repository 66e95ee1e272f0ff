//! Entry point for embedding hosts.
//!
//! [`HostAdapter::pull`] starts a pull in the background and returns a
//! [`Deferred`] right away. The deferred result settles exactly once: with
//! the [`PullReport`] on success, or with a [`Rejection`] carrying the error
//! message.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pullbox_oci::transport::{HostBridgeTransport, HostFetch};
use pullbox_oci::{Authenticator, NoProgress, ProgressSink, Transport};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind, Result};
use crate::pipeline::{PullReport, Puller};

/// Output path used when the host does not choose one.
pub const DEFAULT_OUTPUT: &str = "image.tar";

/// Pulls images on behalf of a host runtime.
#[derive(Clone)]
pub struct HostAdapter {
    puller: Puller,
    output: PathBuf,
    auth: Authenticator,
    sink: Arc<dyn ProgressSink>,
}

impl HostAdapter {
    /// Adapter over any transport, writing to `image.tar` with anonymous
    /// access and no progress reporting.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            puller: Puller::with_transport(transport),
            output: PathBuf::from(DEFAULT_OUTPUT),
            auth: Authenticator::Anonymous,
            sink: Arc::new(NoProgress),
        }
    }

    /// Adapter over the host's own fetch primitive.
    pub fn from_host<F: HostFetch + 'static>(host: F) -> Self {
        Self::new(Arc::new(HostBridgeTransport::new(host)))
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = path.into();
        self
    }

    pub fn auth(mut self, auth: Authenticator) -> Self {
        self.auth = auth;
        self
    }

    pub fn progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Start pulling `image` on the current tokio runtime.
    ///
    /// Outside a runtime the returned value is already rejected.
    pub fn pull(&self, image: &str) -> Deferred {
        let (tx, rx) = oneshot::channel();

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                let _ = tx.send(Err(Error::Background(format!("no async runtime: {}", e))));
                return Deferred { rx };
            }
        };

        let adapter = self.clone();
        let image = image.to_string();
        handle.spawn(async move {
            info!(%image, output = %adapter.output.display(), "host pull started");
            let result = adapter
                .puller
                .pull_to_file(&image, &adapter.output, &adapter.auth, adapter.sink.clone())
                .await;
            match &result {
                Ok(report) => info!(output = %report.output.display(), "image saved"),
                Err(e) => warn!(%image, error = %e, "host pull failed"),
            }
            if tx.send(result).is_err() {
                debug!("deferred pull result dropped by caller");
            }
        });

        Deferred { rx }
    }
}

/// A pull running in the background.
///
/// Awaiting it yields the outcome. Dropping it does not cancel the pull.
#[must_use = "a Deferred does nothing unless awaited"]
pub struct Deferred {
    rx: oneshot::Receiver<Result<PullReport>>,
}

impl Future for Deferred {
    type Output = std::result::Result<PullReport, Rejection>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(report))) => Poll::Ready(Ok(report)),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(Rejection::from(e))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Rejection::from(Error::Background(
                "pull task ended without a result".to_string(),
            )))),
        }
    }
}

/// Why a deferred pull failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub message: String,
    pub kind: ErrorKind,
}

impl From<Error> for Rejection {
    fn from(err: Error) -> Self {
        Self {
            message: err.to_string(),
            kind: err.kind(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Rejection {}
