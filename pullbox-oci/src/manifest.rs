use serde::{Deserialize, Serialize};

use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// OCI Image Manifest
// ---------------------------------------------------------------------------

/// An OCI image manifest (application/vnd.oci.image.manifest.v1+json or
/// application/vnd.docker.distribution.manifest.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub config: Descriptor,

    pub layers: Vec<Descriptor>,
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and image indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub digest: String,

    /// Declared size in bytes. Registries are required to send it, but a
    /// malformed manifest may not.
    #[serde(default)]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// The declared size, or an error if the manifest omitted it.
    pub fn declared_size(&self) -> Result<u64> {
        self.size.ok_or_else(|| {
            OciError::ManifestInconsistency(format!(
                "descriptor {} does not declare a size",
                self.digest
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform for a manifest inside an image index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Build a `Platform` matching the current host.
    pub fn host() -> Self {
        Self {
            architecture: host_arch().to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Map Rust `std::env::consts::ARCH` values to OCI / Docker platform strings.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "s390x" => "s390x",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Image Index (fat manifest)
// ---------------------------------------------------------------------------

/// An OCI image index (application/vnd.oci.image.index.v1+json or
/// application/vnd.docker.distribution.manifest.list.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Select the descriptor whose platform matches the given target.
    pub fn select_platform(&self, target: &Platform) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| {
                if let Some(ref p) = d.platform {
                    p.architecture == target.architecture
                        && p.os == target.os
                        && (target.variant.is_none() || p.variant == target.variant)
                } else {
                    false
                }
            })
            .ok_or_else(|| {
                OciError::NotFound(format!("no manifest found for platform {}", target))
            })
    }
}

// ---------------------------------------------------------------------------
// Image Config
// ---------------------------------------------------------------------------

/// The parts of the image configuration blob needed to sanity-check an
/// image before it is archived. The blob itself is stored verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: String,

    #[serde(default)]
    pub os: String,

    #[serde(default)]
    pub rootfs: Option<RootFs>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type", default)]
    pub fs_type: String,

    #[serde(default)]
    pub diff_ids: Vec<String>,
}

// ---------------------------------------------------------------------------
// Manifest response
// ---------------------------------------------------------------------------

/// The result of fetching a manifest endpoint: either a single manifest or
/// an image index that must be further resolved.
#[derive(Debug, Clone)]
pub enum ManifestResponse {
    Manifest(OciManifest),
    Index(ImageIndex),
}

impl ManifestResponse {
    /// Decode a manifest endpoint body. `content_type` is the response
    /// header, consulted when the document omits `mediaType`.
    pub fn parse(body: &[u8], content_type: Option<&str>) -> Result<Self> {
        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| OciError::ManifestInconsistency(format!("invalid manifest JSON: {}", e)))?;

        let media_type = raw
            .get("mediaType")
            .and_then(|v| v.as_str())
            .or(content_type)
            .unwrap_or("");

        if raw.get("schemaVersion").and_then(|v| v.as_u64()) == Some(1)
            || media_type.starts_with(MEDIA_TYPE_DOCKER_SCHEMA1_PREFIX)
        {
            return Err(OciError::UnsupportedMediaType(
                "docker schema 1 manifests are not supported".to_string(),
            ));
        }

        if is_index_media_type(media_type) || raw.get("manifests").is_some() {
            let idx: ImageIndex = serde_json::from_value(raw).map_err(|e| {
                OciError::ManifestInconsistency(format!("invalid image index: {}", e))
            })?;
            Ok(ManifestResponse::Index(idx))
        } else {
            let m: OciManifest = serde_json::from_value(raw).map_err(|e| {
                OciError::ManifestInconsistency(format!("invalid image manifest: {}", e))
            })?;
            Ok(ManifestResponse::Manifest(m))
        }
    }
}

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
const MEDIA_TYPE_DOCKER_SCHEMA1_PREFIX: &str =
    "application/vnd.docker.distribution.manifest.v1";

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns `true` when `media_type` is a single image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
