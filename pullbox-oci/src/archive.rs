//! `docker load` compatible image tarballs.
//!
//! Layout:
//!
//! ```text
//! sha256:<hex>        image config blob
//! <hex>.tar.gz        one entry per unique layer, bottom layer first
//! manifest.json       [{"Config", "RepoTags", "Layers"}], always last
//! ```
//!
//! Every entry has a ustar header with mode 0644, mtime 0 and uid/gid 0, so
//! the same image always produces the same bytes. Names that overflow the
//! 100 byte ustar name field (sha512 digests) are written as a GNU
//! `././@LongLink` record followed by a GNU header.

use std::collections::HashSet;
use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::error::{OciError, Result};

const BLOCK: usize = 512;
const NAME_FIELD: usize = 100;
const LONG_LINK: &[u8] = b"././@LongLink";
const MANIFEST_ENTRY: &str = "manifest.json";

/// One image in `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveManifestEntry {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

/// Entry name for a config blob: the digest itself.
pub fn config_file_name(digest: &str) -> String {
    digest.to_string()
}

/// Entry name for a layer blob: `<hex>.tar.gz`.
pub fn layer_file_name(digest: &str) -> String {
    let hex = digest.split_once(':').map_or(digest, |(_, hex)| hex);
    format!("{}.tar.gz", hex)
}

// ---------------------------------------------------------------------------
// ArchiveWriter
// ---------------------------------------------------------------------------

/// Streams blobs into a tarball at a fixed path.
///
/// The file only survives a successful [`finish`](Self::finish). Dropping the
/// writer, or calling [`abort`](Self::abort), removes whatever was written.
pub struct ArchiveWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    config: Option<String>,
    layers: Vec<String>,
    seen: HashSet<String>,
    armed: bool,
}

impl ArchiveWriter {
    /// Create (or truncate) the archive at `path`.
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::create(&path)
            .await
            .map_err(|e| OciError::write(&path, e))?;
        debug!(path = %path.display(), "archive opened");
        Ok(Self {
            path,
            out: Some(BufWriter::new(file)),
            config: None,
            layers: Vec::new(),
            seen: HashSet::new(),
            armed: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the image config blob.
    pub async fn add_config(&mut self, digest: &str, data: &[u8]) -> Result<()> {
        let name = config_file_name(digest);
        self.append_bytes(&name, data).await?;
        self.config = Some(name);
        Ok(())
    }

    /// Whether a layer with `digest` has already been written.
    pub fn has_layer(&self, digest: &str) -> bool {
        self.seen.contains(digest)
    }

    /// Record another occurrence of an already written layer. Returns
    /// `false`, recording nothing, if the blob is not in the archive yet.
    pub fn reuse_layer(&mut self, digest: &str) -> bool {
        if !self.has_layer(digest) {
            return false;
        }
        debug!(%digest, "layer already archived");
        self.layers.push(layer_file_name(digest));
        true
    }

    /// Stream a layer blob of exactly `size` bytes into the archive.
    ///
    /// Errors yielded by `body` are returned unchanged. A layer that was
    /// already written is only recorded again, without reading `body`.
    pub async fn add_layer<S>(&mut self, digest: &str, size: u64, body: S) -> Result<()>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        if self.reuse_layer(digest) {
            return Ok(());
        }
        let name = layer_file_name(digest);
        self.append_stream(&name, size, body).await?;
        self.seen.insert(digest.to_string());
        self.layers.push(name);
        Ok(())
    }

    /// Write `manifest.json` and the end-of-archive marker, then sync the
    /// file to disk. Returns the archive path.
    pub async fn finish(mut self, repo_tags: Vec<String>) -> Result<PathBuf> {
        let config = self.config.clone().ok_or_else(|| {
            OciError::Serialization("archive has no config entry".to_string())
        })?;
        let manifest = vec![ArchiveManifestEntry {
            config,
            repo_tags,
            layers: self.layers.clone(),
        }];
        let json =
            serde_json::to_vec(&manifest).map_err(|e| OciError::Serialization(e.to_string()))?;
        self.append_bytes(MANIFEST_ENTRY, &json).await?;

        let path = self.path.clone();
        let out = self.writer()?;
        out.write_all(&[0u8; 2 * BLOCK])
            .await
            .map_err(|e| OciError::write(&path, e))?;
        out.flush().await.map_err(|e| OciError::write(&path, e))?;
        out.get_ref()
            .sync_all()
            .await
            .map_err(|e| OciError::write(&path, e))?;

        self.out = None;
        self.armed = false;
        info!(path = %path.display(), layers = self.layers.len(), "archive written");
        Ok(path)
    }

    /// Close and remove the partial archive.
    pub async fn abort(mut self) {
        self.out = None;
        self.armed = false;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "partial archive removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove partial archive"),
        }
    }

    // -- internals ----------------------------------------------------------

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        let path = &self.path;
        self.out.as_mut().ok_or_else(|| {
            OciError::write(
                path,
                std::io::Error::new(std::io::ErrorKind::Other, "archive already closed"),
            )
        })
    }

    async fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let chunk = Bytes::copy_from_slice(data);
        let body = futures_util::stream::iter(std::iter::once(Ok(chunk)));
        self.append_stream(name, data.len() as u64, body).await
    }

    /// Write a header declaring `size` bytes, copy the body, then pad to the
    /// block boundary.
    async fn append_stream<S>(&mut self, name: &str, size: u64, mut body: S) -> Result<()>
    where
        S: Stream<Item = Result<Bytes>> + Unpin,
    {
        let header = entry_header(name, size)?;
        let path = self.path.clone();
        let out = self.writer()?;
        out.write_all(&header)
            .await
            .map_err(|e| OciError::write(&path, e))?;

        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            if written > size {
                return Err(OciError::Serialization(format!(
                    "entry {} is longer than its {} byte header",
                    name, size
                )));
            }
            out.write_all(&chunk)
                .await
                .map_err(|e| OciError::write(&path, e))?;
        }
        if written != size {
            return Err(OciError::Serialization(format!(
                "entry {} ended after {} of {} bytes",
                name, written, size
            )));
        }

        out.write_all(&[0u8; BLOCK][..padding(size)])
            .await
            .map_err(|e| OciError::write(&path, e))?;
        debug!(entry = %name, size, "archive entry written");
        Ok(())
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.out = None;
        // Blocking on purpose: Drop cannot await. Error paths go through `abort`.
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove partial archive");
            }
        }
    }
}

/// Header blocks for an entry of `size` bytes named `name`.
fn entry_header(name: &str, size: u64) -> Result<Vec<u8>> {
    if name.len() <= NAME_FIELD {
        let mut header = tar::Header::new_ustar();
        header
            .set_path(name)
            .map_err(|e| OciError::Serialization(format!("bad entry name {}: {}", name, e)))?;
        fill_header(&mut header, tar::EntryType::Regular, size);
        return Ok(header.as_bytes().to_vec());
    }

    // GNU long name: a `L` record carrying the NUL-terminated name, then the
    // real header with the name truncated to the field.
    let long_len = name.len() + 1;
    let mut long = tar::Header::new_gnu();
    long.as_old_mut().name[..LONG_LINK.len()].copy_from_slice(LONG_LINK);
    fill_header(&mut long, tar::EntryType::GNULongName, long_len as u64);

    let mut header = tar::Header::new_gnu();
    header
        .as_old_mut()
        .name
        .copy_from_slice(&name.as_bytes()[..NAME_FIELD]);
    fill_header(&mut header, tar::EntryType::Regular, size);

    let mut blocks = Vec::with_capacity(3 * BLOCK + long_len);
    blocks.extend_from_slice(long.as_bytes());
    blocks.extend_from_slice(name.as_bytes());
    blocks.push(0);
    blocks.resize(blocks.len() + padding(long_len as u64), 0);
    blocks.extend_from_slice(header.as_bytes());
    Ok(blocks)
}

fn fill_header(header: &mut tar::Header, kind: tar::EntryType, size: u64) {
    header.set_entry_type(kind);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_cksum();
}

/// Zero bytes needed after `size` bytes of data to reach a block boundary.
fn padding(size: u64) -> usize {
    (BLOCK - (size % BLOCK as u64) as usize) % BLOCK
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// Load `manifest.json` from an archive and check that every entry it
/// references is present.
pub fn read_manifest(path: &Path) -> Result<Vec<ArchiveManifestEntry>> {
    let mut names = HashSet::new();
    let mut manifest = None;

    let file = std::fs::File::open(path).map_err(|e| OciError::write(path, e))?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries().map_err(|e| OciError::write(path, e))? {
        let mut entry = entry.map_err(|e| OciError::write(path, e))?;
        let name = entry
            .path()
            .map_err(|e| OciError::write(path, e))?
            .to_string_lossy()
            .into_owned();
        if name == MANIFEST_ENTRY {
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| OciError::write(path, e))?;
            manifest = Some(data);
        }
        names.insert(name);
    }

    let data = manifest
        .ok_or_else(|| OciError::Serialization(format!("{} has no manifest.json", path.display())))?;
    let entries: Vec<ArchiveManifestEntry> = serde_json::from_slice(&data)
        .map_err(|e| OciError::Serialization(format!("invalid manifest.json: {}", e)))?;

    for entry in &entries {
        for name in std::iter::once(&entry.config).chain(&entry.layers) {
            if !names.contains(name) {
                return Err(OciError::Serialization(format!(
                    "manifest.json references missing entry {}",
                    name
                )));
            }
        }
    }
    Ok(entries)
}

/// Read one entry of an archive into memory.
pub fn read_entry(path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let file = std::fs::File::open(path).map_err(|e| OciError::write(path, e))?;
    let mut archive = tar::Archive::new(file);
    for entry in archive.entries().map_err(|e| OciError::write(path, e))? {
        let mut entry = entry.map_err(|e| OciError::write(path, e))?;
        if entry.path().map_err(|e| OciError::write(path, e))?.to_string_lossy() == name {
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| OciError::write(path, e))?;
            return Ok(Some(data));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
