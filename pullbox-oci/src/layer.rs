use std::collections::HashSet;

use crate::error::Result;
use crate::manifest::OciManifest;

/// Metadata about one layer blob, as declared by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Content-addressable digest (e.g. "sha256:abcdef…").
    pub digest: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// OCI media type (e.g. "application/vnd.oci.image.layer.v1.tar+gzip").
    pub media_type: String,
}

impl LayerDescriptor {
    /// Enumerate a manifest's layers, bottom layer first. Fails if any layer
    /// does not declare its size.
    pub fn from_manifest(manifest: &OciManifest) -> Result<Vec<Self>> {
        manifest
            .layers
            .iter()
            .map(|desc| {
                Ok(Self {
                    digest: desc.digest.clone(),
                    size: desc.declared_size()?,
                    media_type: desc.media_type.clone(),
                })
            })
            .collect()
    }
}

/// Number of bytes needed to download `layers`. A blob shared by several
/// layers is downloaded once, so it is counted once.
pub fn total_download_size(layers: &[LayerDescriptor]) -> u64 {
    let mut seen = HashSet::new();
    layers
        .iter()
        .filter(|l| seen.insert(l.digest.as_str()))
        .map(|l| l.size)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn manifest(layers: &str) -> OciManifest {
        serde_json::from_str(&format!(
            r#"{{
                "schemaVersion": 2,
                "config": {{"mediaType": "application/vnd.oci.image.config.v1+json", "digest": "sha256:cfg", "size": 10}},
                "layers": {}
            }}"#,
            layers
        ))
        .unwrap()
    }

    #[test]
    fn enumerates_layers_in_order() {
        let m = manifest(
            r#"[{"mediaType": "a", "digest": "sha256:01", "size": 5},
                {"mediaType": "b", "digest": "sha256:02", "size": 7}]"#,
        );
        let layers = LayerDescriptor::from_manifest(&m).unwrap();
        let digests: Vec<_> = layers.iter().map(|l| l.digest.as_str()).collect();
        assert_eq!(digests, ["sha256:01", "sha256:02"]);
        assert_eq!(total_download_size(&layers), 12);
    }

    #[test]
    fn missing_size_fails_enumeration() {
        let m = manifest(
            r#"[{"mediaType": "a", "digest": "sha256:01", "size": 5},
                {"mediaType": "b", "digest": "sha256:02"}]"#,
        );
        let err = LayerDescriptor::from_manifest(&m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManifestInconsistency);
    }

    #[test]
    fn shared_blobs_count_once() {
        let m = manifest(
            r#"[{"mediaType": "a", "digest": "sha256:01", "size": 5},
                {"mediaType": "a", "digest": "sha256:01", "size": 5},
                {"mediaType": "b", "digest": "sha256:02", "size": 7}]"#,
        );
        let layers = LayerDescriptor::from_manifest(&m).unwrap();
        assert_eq!(layers.len(), 3);
        assert_eq!(total_download_size(&layers), 12);
    }
}
