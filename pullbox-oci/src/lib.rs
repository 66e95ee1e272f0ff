//! OCI Distribution client used by `pullbox`.
//!
//! The crate covers the registry side of a pull: parsing references,
//! answering auth challenges, resolving manifests, and streaming verified
//! blobs into a `docker load` compatible tarball. Networking goes through
//! the [`Transport`](transport::Transport) trait so the same client runs on
//! `reqwest` or on a fetch primitive supplied by an embedding host.

pub mod archive;
pub mod auth;
pub mod blob;
pub mod error;
pub mod layer;
pub mod manifest;
pub mod progress;
pub mod reference;
pub mod registry;
pub mod transport;

pub use archive::{read_manifest, ArchiveManifestEntry, ArchiveWriter};
pub use auth::Authenticator;
pub use blob::VerifiedBody;
pub use error::{ErrorKind, OciError, Result};
pub use layer::LayerDescriptor;
pub use manifest::{OciManifest, Platform};
pub use progress::{NoProgress, ProgressMeter, ProgressSink, ProgressTransport};
pub use reference::ImageRef;
pub use registry::{RegistryClient, ResolvedManifest};
pub use transport::{Body, Request, Response, Transport};
