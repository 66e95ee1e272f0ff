use crate::error::{OciError, Result};
use std::fmt;

/// Registry host that Docker Hub short names resolve to.
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

const DOCKER_HUB_ALIASES: [&str; 2] = ["docker.io", "index.docker.io"];
const MAX_REPOSITORY_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

// ---------------------------------------------------------------------------
// ImageRef
// ---------------------------------------------------------------------------

/// A parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry hostname (e.g. "registry-1.docker.io").
    pub registry: String,
    /// Repository path (e.g. "library/alpine").
    pub repository: String,
    /// Tag or digest reference (e.g. "latest" or "sha256:abc123").
    pub reference: String,
}

impl ImageRef {
    /// Parse a raw image reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ubuntu`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:<64 hex chars>`
    ///
    /// The string is validated against the distribution reference grammar;
    /// anything that does not name exactly one artifact is rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::invalid_reference(raw, "empty image reference"));
        }

        // Split off the digest first; a digest wins over any tag.
        let (name_and_tag, digest) = match raw.split_once('@') {
            Some((name, digest)) => {
                validate_digest(raw, digest)?;
                (name, Some(digest.to_string()))
            }
            None => (raw, None),
        };

        // A tag colon always comes after the last '/', so "localhost:5000/repo"
        // keeps its port.
        let after_last_slash = name_and_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name_part, tag) = match name_and_tag.rfind(':') {
            Some(colon_pos) if colon_pos >= after_last_slash => {
                let tag = &name_and_tag[colon_pos + 1..];
                validate_tag(raw, tag)?;
                (&name_and_tag[..colon_pos], Some(tag.to_string()))
            }
            _ => (name_and_tag, None),
        };

        // A leading component is a registry hostname when it contains a dot
        // or a port, or is "localhost".
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                validate_domain(raw, first)?;
                (first.to_string(), rest.to_string())
            }
            _ => (DOCKER_HUB_REGISTRY.to_string(), name_part.to_string()),
        };

        let registry = if DOCKER_HUB_ALIASES.contains(&registry.as_str()) {
            DOCKER_HUB_REGISTRY.to_string()
        } else {
            registry
        };

        // Docker Hub official images without "library/" prefix.
        let repository = if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository
        };

        validate_repository(raw, &repository)?;

        let reference = digest.or(tag).unwrap_or_else(|| "latest".to_string());

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Whether this reference addresses content by digest rather than tag.
    pub fn is_digest(&self) -> bool {
        // Tags cannot contain ':', digests always do.
        self.reference.contains(':')
    }

    /// The same repository, addressed by `digest`.
    pub fn pinned(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            reference: digest.to_string(),
        }
    }

    /// Short form used by Docker tooling: Docker Hub registry and the
    /// `library/` namespace are elided (`alpine:latest`,
    /// `example.com/repo:v1`).
    pub fn familiar(&self) -> String {
        let name = if self.registry == DOCKER_HUB_REGISTRY {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            format!("{}/{}", self.registry, self.repository)
        };
        format!("{}{}{}", name, self.separator(), self.reference)
    }

    fn separator(&self) -> char {
        if self.is_digest() {
            '@'
        } else {
            ':'
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}{}{}",
            self.registry,
            self.repository,
            self.separator(),
            self.reference
        )
    }
}

impl std::str::FromStr for ImageRef {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Grammar checks
// ---------------------------------------------------------------------------

fn validate_domain(raw: &str, domain: &str) -> Result<()> {
    let (host, port) = match domain.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (domain, None),
    };

    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(OciError::invalid_reference(
                raw,
                format!("invalid registry port {:?}", port),
            ));
        }
    }

    let valid_label = |label: &str| {
        let bytes = label.as_bytes();
        !bytes.is_empty()
            && bytes[0].is_ascii_alphanumeric()
            && bytes[bytes.len() - 1].is_ascii_alphanumeric()
            && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
    };

    if host.split('.').all(valid_label) {
        Ok(())
    } else {
        Err(OciError::invalid_reference(
            raw,
            format!("invalid registry host {:?}", host),
        ))
    }
}

fn validate_repository(raw: &str, repository: &str) -> Result<()> {
    if repository.is_empty() {
        return Err(OciError::invalid_reference(raw, "missing repository"));
    }
    if repository.len() > MAX_REPOSITORY_LEN {
        return Err(OciError::invalid_reference(
            raw,
            format!("repository name longer than {} characters", MAX_REPOSITORY_LEN),
        ));
    }
    match repository.split('/').find(|c| !valid_path_component(c)) {
        Some(bad) => Err(OciError::invalid_reference(
            raw,
            format!(
                "invalid repository component {:?} (lowercase letters, digits and separators only)",
                bad
            ),
        )),
        None => Ok(()),
    }
}

/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`
fn valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let is_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let mut i = 0;
    loop {
        let run_start = i;
        while i < bytes.len() && is_alnum(bytes[i]) {
            i += 1;
        }
        if i == run_start {
            return false;
        }
        if i == bytes.len() {
            return true;
        }

        let sep_start = i;
        while i < bytes.len() && !is_alnum(bytes[i]) {
            i += 1;
        }
        let sep = &component[sep_start..i];
        let valid_sep =
            sep == "." || sep == "_" || sep == "__" || sep.bytes().all(|b| b == b'-');
        if !valid_sep {
            return false;
        }
    }
}

fn validate_tag(raw: &str, tag: &str) -> Result<()> {
    let bytes = tag.as_bytes();
    let is_word = |b: &u8| b.is_ascii_alphanumeric() || *b == b'_';
    let valid = !bytes.is_empty()
        && bytes.len() <= MAX_TAG_LEN
        && is_word(&bytes[0])
        && bytes.iter().all(|b| is_word(b) || *b == b'.' || *b == b'-');
    if valid {
        Ok(())
    } else {
        Err(OciError::invalid_reference(
            raw,
            format!("invalid tag {:?}", tag),
        ))
    }
}

fn validate_digest(raw: &str, digest: &str) -> Result<()> {
    let (algorithm, hex) = digest
        .split_once(':')
        .ok_or_else(|| OciError::invalid_reference(raw, "digest is missing its algorithm"))?;

    let expected_len = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        other => {
            return Err(OciError::invalid_reference(
                raw,
                format!("unsupported digest algorithm {:?}", other),
            ))
        }
    };

    if hex.len() != expected_len {
        return Err(OciError::invalid_reference(
            raw,
            format!(
                "{} digest must be {} hex characters, got {}",
                algorithm,
                expected_len,
                hex.len()
            ),
        ));
    }
    if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return Err(OciError::invalid_reference(
            raw,
            "digest must be lowercase hex",
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
