//! Credential selection and registry challenge parsing.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};

/// How the registry client presents itself to a registry.
#[derive(Clone, Default)]
pub enum Authenticator {
    /// No credentials; bearer tokens are requested anonymously.
    #[default]
    Anonymous,
    /// Username/password, sent as HTTP basic auth to the registry or its
    /// token endpoint.
    Basic {
        username: String,
        password: SecretString,
    },
}

impl Authenticator {
    /// Use basic credentials only when both fields are non-empty; anything
    /// else degrades to anonymous access.
    pub fn from_credentials(username: Option<&str>, password: Option<&SecretString>) -> Self {
        match (username, password) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.expose_secret().is_empty() => {
                Authenticator::Basic {
                    username: user.to_string(),
                    password: pass.clone(),
                }
            }
            _ => Authenticator::Anonymous,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Authenticator::Anonymous)
    }

    /// `Authorization` header value for HTTP basic auth, if credentials are
    /// configured.
    pub(crate) fn basic_header(&self) -> Option<String> {
        match self {
            Authenticator::Anonymous => None,
            Authenticator::Basic { username, password } => {
                let raw = format!("{}:{}", username, password.expose_secret());
                Some(format!("Basic {}", STANDARD.encode(raw)))
            }
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Authenticator::Anonymous => f.write_str("Anonymous"),
            Authenticator::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// WWW-Authenticate
// ---------------------------------------------------------------------------

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Challenge {
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    Basic,
}

impl Challenge {
    pub(crate) fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.eq_ignore_ascii_case("basic") {
            return Some(Challenge::Basic);
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let realm = extract_param(params, "realm").filter(|r| !r.is_empty())?;
        Some(Challenge::Bearer {
            realm,
            service: extract_param(params, "service"),
            scope: extract_param(params, "scope"),
        })
    }
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    let mut offset = 0;
    while let Some(found) = header[offset..].find(&search) {
        let start = offset + found;
        // Only match whole parameter names ("scope" must not match "xscope").
        let at_boundary = start == 0
            || matches!(header.as_bytes()[start - 1], b',' | b' ');
        let value_start = start + search.len();
        if at_boundary {
            let end = header[value_start..].find('"')?;
            return Some(header[value_start..value_start + end].to_string());
        }
        offset = value_start;
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
