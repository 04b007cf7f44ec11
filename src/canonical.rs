//! URL canonicalization collaborator (spec §6).
//!
//! Goblet depends on canonicalization through a trait rather than baking in
//! one policy, mirroring the teacher's `AuthenticationService` collaborator
//! pattern in `protocol::core`. The default implementation normalizes a
//! scheme+host+path into the mirror cache key used everywhere else in the
//! crate (`RepositoryId`).

use async_trait::async_trait;
use std::fmt;
use url::Url;

use crate::error::GobletError;

/// The canonical identity of an upstream repository: also the mirror
/// directory name (relative to `cache_root`) and the single-flight lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryId(String);

impl RepositoryId {
    pub fn new(canonical: String) -> Self {
        RepositoryId(canonical)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Mirror path relative to the cache root: `<scheme>/<host>/<path>.git`,
    /// safe to join onto a filesystem root (no `..`, no leading `/`).
    pub fn relative_mirror_path(&self) -> String {
        self.0.trim_start_matches('/').to_string()
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait UrlCanonicalizer: Send + Sync {
    async fn canonicalize(&self, origin_url: &str) -> Result<RepositoryId, GobletError>;
}

/// Default canonicalizer: lowercases scheme+host, strips default ports,
/// trims trailing slashes, and ensures a single `.git` suffix.
pub struct DefaultCanonicalizer;

#[async_trait]
impl UrlCanonicalizer for DefaultCanonicalizer {
    async fn canonicalize(&self, origin_url: &str) -> Result<RepositoryId, GobletError> {
        let url = Url::parse(origin_url)
            .map_err(|e| GobletError::Protocol(format!("invalid origin url: {e}")))?;

        let scheme = url.scheme().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(GobletError::Protocol(format!(
                "unsupported origin scheme: {scheme}"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| GobletError::Protocol("origin url has no host".into()))?
            .to_ascii_lowercase();

        let mut path = url.path().trim_matches('/').to_string();
        if !path.ends_with(".git") {
            path.push_str(".git");
        }
        if path == ".git" {
            return Err(GobletError::Protocol("origin url has no repository path".into()));
        }

        let port_suffix = match (scheme.as_str(), url.port()) {
            ("http", Some(80)) | ("https", Some(443)) | (_, None) => String::new(),
            (_, Some(port)) => format!("_{port}"),
        };

        Ok(RepositoryId::new(format!("{scheme}/{host}{port_suffix}/{path}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn canonicalizes_and_appends_git_suffix() {
        let id = DefaultCanonicalizer
            .canonicalize("https://github.com/rust-lang/rust")
            .await
            .unwrap();
        assert_eq!(id.as_str(), "https/github.com/rust-lang/rust.git");
    }

    #[tokio::test]
    async fn strips_default_port_and_keeps_git_suffix() {
        let id = DefaultCanonicalizer
            .canonicalize("https://GitHub.com:443/foo/bar.git")
            .await
            .unwrap();
        assert_eq!(id.as_str(), "https/github.com/foo/bar.git");
    }

    #[tokio::test]
    async fn rejects_non_http_scheme() {
        assert!(DefaultCanonicalizer
            .canonicalize("ssh://git@github.com/foo/bar.git")
            .await
            .is_err());
    }
}
