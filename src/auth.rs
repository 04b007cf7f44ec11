//! Authentication collaborator (spec §6).
//!
//! Grounded on the teacher's `protocol::core::AuthenticationService` trait
//! and its `AllowAllAuth` demonstration impl in `examples/http_server.rs`.
//! Goblet treats credential *validation* as out of scope policy supplied by
//! the embedder; the default here simply passes headers through to whatever
//! upstream fetch eventually makes, matching a read-through cache's actual
//! security boundary (the origin still enforces its own auth).

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::GobletError;

#[async_trait]
pub trait AuthenticationService: Send + Sync {
    /// Inspects the inbound request's headers and either approves the
    /// request (returning headers to forward to upstream, e.g. a
    /// reconstructed `Authorization` header) or rejects it.
    async fn authenticate(
        &self,
        headers: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, GobletError>;
}

/// Forwards whatever `Authorization` header the client sent, rejecting
/// nothing at the Goblet layer. Suitable when the upstream origin is the
/// sole source of truth for credentials.
pub struct PassthroughAuth;

#[async_trait]
impl AuthenticationService for PassthroughAuth {
    async fn authenticate(
        &self,
        headers: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, GobletError> {
        let mut forwarded = HashMap::new();
        if let Some(auth) = headers.get("authorization") {
            forwarded.insert("authorization".to_string(), auth.clone());
        }
        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_forwards_authorization_header() {
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), "Bearer abc".to_string());
        headers.insert("user-agent".to_string(), "git/2.40".to_string());

        let forwarded = PassthroughAuth.authenticate(&headers).await.unwrap();
        assert_eq!(forwarded.get("authorization").unwrap(), "Bearer abc");
        assert!(!forwarded.contains_key("user-agent"));
    }
}
