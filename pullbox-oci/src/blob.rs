//! Length- and digest-checked blob streams.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{OciError, Result};
use crate::transport::Body;

/// Wraps a blob body and enforces the descriptor contract: exactly
/// `expected` bytes, hashing to `digest`.
///
/// Errors surface as the final stream item. The stream is fused afterwards.
pub struct VerifiedBody {
    inner: Body,
    digest: String,
    expected: u64,
    received: u64,
    hasher: Option<Sha256>,
    done: bool,
}

impl VerifiedBody {
    pub fn new(inner: Body, digest: impl Into<String>, expected: u64) -> Self {
        let digest = digest.into();
        let hasher = if digest.starts_with("sha256:") {
            Some(Sha256::new())
        } else {
            debug!(%digest, "no verifier for digest algorithm, checking length only");
            None
        };
        Self {
            inner,
            digest,
            expected,
            received: 0,
            hasher,
            done: false,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn expected(&self) -> u64 {
        self.expected
    }

    /// Drain the blob into memory, verifying it on the way.
    pub async fn bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.expected.min(16 * 1024 * 1024) as usize);
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    fn interrupted(&self) -> OciError {
        OciError::TransferInterrupted {
            digest: self.digest.clone(),
            expected: self.expected,
            received: self.received,
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.received < self.expected {
            return Err(self.interrupted());
        }
        if let Some(hasher) = self.hasher.take() {
            let actual = format!("sha256:{}", hex_encode(&hasher.finalize()));
            if actual != self.digest {
                return Err(OciError::DigestMismatch {
                    expected: self.digest.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

impl Stream for VerifiedBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        let item = match self.inner.poll_next_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(item) => item,
        };

        match item {
            Some(Ok(chunk)) => {
                self.received += chunk.len() as u64;
                if self.received > self.expected {
                    self.done = true;
                    return Poll::Ready(Some(Err(OciError::ManifestInconsistency(format!(
                        "blob {} is larger than its declared {} bytes",
                        self.digest, self.expected
                    )))));
                }
                if let Some(hasher) = self.hasher.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => {
                self.done = true;
                warn!(digest = %self.digest, received = self.received, error = %e, "blob stream failed");
                Poll::Ready(Some(Err(self.interrupted())))
            }
            None => {
                self.done = true;
                match self.finish() {
                    Ok(()) => Poll::Ready(None),
                    Err(e) => Poll::Ready(Some(Err(e))),
                }
            }
        }
    }
}

/// SHA-256 digest of `data` in `sha256:<hex>` form.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex_encode(&Sha256::digest(data)))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
