//! Pipeline: pull one image into one tarball.
//!
//! A pull runs two passes over the registry:
//!
//! 1. **Discover**: resolve the manifest, enumerate layers, and sum their
//!    declared sizes. The config blob is fetched here as well. No layer
//!    bytes are read.
//! 2. **Fetch**: re-fetch the manifest by the digest pinned in pass 1
//!    through a [`ProgressTransport`], then stream every layer straight into
//!    the [`ArchiveWriter`].
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use pull_box::pipeline::Puller;
//! use pullbox_oci::Authenticator;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let puller = Puller::native()?;
//! let report = puller
//!     .pull_to_file(
//!         "alpine:3.20",
//!         Path::new("alpine.tar"),
//!         &Authenticator::Anonymous,
//!         Arc::new(|done: u64, total: u64| eprintln!("{done}/{total}")),
//!     )
//!     .await?;
//! println!("wrote {} ({} bytes)", report.output.display(), report.total_bytes);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pullbox_oci::layer::total_download_size;
use pullbox_oci::manifest::ImageConfig;
use pullbox_oci::{
    ArchiveWriter, Authenticator, ErrorKind as OciErrorKind, ImageRef, LayerDescriptor,
    OciError, OciManifest, Platform, ProgressMeter, ProgressSink, ProgressTransport,
    RegistryClient, Transport,
};
use tracing::{debug, info};

use crate::error::{Error, Result, Stage};

/// Outcome of a successful pull.
#[derive(Debug, Clone)]
pub struct PullReport {
    /// The image as requested, fully qualified.
    pub reference: ImageRef,
    /// Digest of the manifest that was archived.
    pub manifest_digest: String,
    pub config_digest: String,
    /// Layers in archive order, including repeated digests.
    pub layers: Vec<LayerDescriptor>,
    /// Bytes the progress meter was sized for.
    pub total_bytes: u64,
    pub output: PathBuf,
}

/// What the sizing pass learned about an image.
struct Discovery {
    image: ImageRef,
    pinned: ImageRef,
    manifest: OciManifest,
    manifest_digest: String,
    layers: Vec<LayerDescriptor>,
    config: Vec<u8>,
    total: u64,
}

/// Pulls images over a shared base transport.
///
/// Every call builds its own registry client, token cache, progress meter,
/// and archive writer, so concurrent pulls on one `Puller` are independent.
#[derive(Clone)]
pub struct Puller {
    transport: Arc<dyn Transport>,
    platform: Platform,
}

impl Puller {
    /// Puller over a native `reqwest` connection pool.
    pub fn native() -> Result<Self> {
        let transport = pullbox_oci::transport::ReqwestTransport::new()
            .map_err(Error::at(Stage::Discover))?;
        Ok(Self::with_transport(Arc::new(transport)))
    }

    pub fn with_transport(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            platform: Platform::host(),
        }
    }

    /// Platform used to pick a manifest out of an image index.
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Pull `image` and write it to `output` as a `docker load` tarball.
    ///
    /// `sink` first sees `(0, total)` once discovery is done, then one update
    /// per chunk of layer data read. On failure no file is left at `output`.
    pub async fn pull_to_file(
        &self,
        image: &str,
        output: &Path,
        auth: &Authenticator,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<PullReport> {
        let image = ImageRef::parse(image).map_err(Error::at(Stage::Resolve))?;
        info!(
            registry = %image.registry,
            repository = %image.repository,
            reference = %image.reference,
            "pulling image",
        );

        let discovery = self
            .discover(image, auth)
            .await
            .map_err(Error::at(Stage::Discover))?;
        info!(
            layers = discovery.layers.len(),
            total_bytes = discovery.total,
            digest = %discovery.manifest_digest,
            "discovery complete",
        );

        let meter = ProgressMeter::new(discovery.total, sink);
        let instrumented = Arc::new(ProgressTransport::new(self.transport.clone(), meter.clone()));
        let client = RegistryClient::new(instrumented, auth.clone());

        self.confirm_manifest(&client, &discovery)
            .await
            .map_err(Error::at(Stage::Fetch))?;

        let mut writer = ArchiveWriter::create(output)
            .await
            .map_err(Error::at(Stage::Archive))?;
        if let Err(e) = write_archive(&client, &mut writer, &discovery).await {
            writer.abort().await;
            return Err(e);
        }

        let repo_tags = if discovery.image.is_digest() {
            Vec::new()
        } else {
            vec![discovery.image.familiar()]
        };
        let output = writer
            .finish(repo_tags)
            .await
            .map_err(Error::at(Stage::Archive))?;

        debug!(
            transferred = meter.transferred(),
            total = meter.total(),
            "pull complete"
        );
        Ok(PullReport {
            reference: discovery.image,
            manifest_digest: discovery.manifest_digest,
            config_digest: discovery.manifest.config.digest.clone(),
            layers: discovery.layers,
            total_bytes: discovery.total,
            output,
        })
    }

    /// Sizing pass over the plain transport.
    async fn discover(&self, image: ImageRef, auth: &Authenticator) -> pullbox_oci::Result<Discovery> {
        let client = RegistryClient::new(self.transport.clone(), auth.clone());
        let resolved = client.resolve_manifest(&image, &self.platform).await?;

        let layers = LayerDescriptor::from_manifest(&resolved.manifest)?;
        let total = total_download_size(&layers);

        let pinned = image.pinned(&resolved.digest);
        let config = client.fetch_blob(&pinned, &resolved.manifest.config).await?;
        check_config(&config, &layers)?;

        Ok(Discovery {
            image,
            pinned,
            manifest: resolved.manifest,
            manifest_digest: resolved.digest,
            layers,
            config,
            total,
        })
    }

    /// Re-fetch the pinned manifest and make sure it still describes the
    /// discovered layers.
    async fn confirm_manifest(
        &self,
        client: &RegistryClient,
        discovery: &Discovery,
    ) -> pullbox_oci::Result<()> {
        let refetched = client
            .fetch_manifest_by_digest(&discovery.pinned, &discovery.manifest_digest)
            .await?;
        let layers = LayerDescriptor::from_manifest(&refetched.manifest)?;
        if layers != discovery.layers
            || refetched.manifest.config.digest != discovery.manifest.config.digest
        {
            return Err(OciError::ManifestInconsistency(format!(
                "manifest {} changed between discovery and fetch",
                discovery.manifest_digest
            )));
        }
        Ok(())
    }
}

/// Stream the config and every unique layer into `writer`.
async fn write_archive(
    client: &RegistryClient,
    writer: &mut ArchiveWriter,
    discovery: &Discovery,
) -> Result<()> {
    writer
        .add_config(&discovery.manifest.config.digest, &discovery.config)
        .await
        .map_err(Error::at(Stage::Archive))?;

    for desc in &discovery.manifest.layers {
        if writer.reuse_layer(&desc.digest) {
            continue;
        }
        let body = client
            .open_blob(&discovery.pinned, desc)
            .await
            .map_err(Error::at(Stage::Fetch))?;
        let size = body.expected();
        debug!(digest = %desc.digest, size, "streaming layer");
        writer
            .add_layer(&desc.digest, size, body)
            .await
            .map_err(|e| {
                let stage = match e.kind() {
                    OciErrorKind::WriteError | OciErrorKind::SerializationError => Stage::Archive,
                    _ => Stage::Fetch,
                };
                Error::at(stage)(e)
            })?;
    }
    Ok(())
}

/// The config must be valid JSON, and when it lists `rootfs.diff_ids` there
/// must be one per manifest layer.
fn check_config(config: &[u8], layers: &[LayerDescriptor]) -> pullbox_oci::Result<()> {
    let parsed: ImageConfig = serde_json::from_slice(config)
        .map_err(|e| OciError::ManifestInconsistency(format!("invalid image config: {}", e)))?;
    if let Some(rootfs) = parsed.rootfs {
        if !rootfs.diff_ids.is_empty() && rootfs.diff_ids.len() != layers.len() {
            return Err(OciError::ManifestInconsistency(format!(
                "config lists {} diff_ids for {} layers",
                rootfs.diff_ids.len(),
                layers.len()
            )));
        }
    }
    Ok(())
}
