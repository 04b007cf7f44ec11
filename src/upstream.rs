//! Upstream client (component C).
//!
//! Grounded on the same subprocess-delegation idiom as `mirror.rs`
//! (`examples/http_server.rs`'s `FsRepository::run_git`), applied to a
//! remote URL instead of a local git-dir: `git ls-remote` and
//! `git -c protocol.version=2 fetch`. Deadline/cancellation discipline
//! (`timeout` + `kill_on_drop`) follows the subprocess-pool pattern in
//! `FintanH-radicle-link/git-server/src/processes.rs`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::GobletError;

#[derive(Debug, Clone)]
pub struct UpstreamRef {
    pub name: String,
    pub oid: String,
    pub symref_target: Option<String>,
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// `credentials` is whatever the auth collaborator approved forwarding
    /// (spec §4.C: "Credentials come from the auth collaborator; the client
    /// never persists them") — currently just a forwarded `authorization`
    /// entry, passed to `git` as an extra HTTP header rather than stored.
    async fn ls_refs(
        &self,
        origin_url: &str,
        credentials: &HashMap<String, String>,
    ) -> Result<Vec<UpstreamRef>, GobletError>;

    /// Fetches everything from `origin_url` into `refs/mirror/*` inside
    /// `git_dir`. Does not touch `refs/*` directly — the caller
    /// (`MirrorStore`'s refresh path) performs the atomic swap afterward so
    /// a failed fetch never leaves the visible refs partially updated.
    async fn fetch_into_mirror(
        &self,
        origin_url: &str,
        git_dir: &Path,
        credentials: &HashMap<String, String>,
    ) -> Result<(), GobletError>;
}

pub struct GitUpstreamClient {
    pub timeout: Duration,
}

impl GitUpstreamClient {
    pub fn new(timeout: Duration) -> Self {
        GitUpstreamClient { timeout }
    }

    async fn run_with_deadline(&self, mut cmd: Command) -> Result<std::process::Output, GobletError> {
        cmd.kill_on_drop(true);
        let fut = cmd.output();
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(io_err)) => Err(GobletError::UpstreamNetwork(io_err.to_string())),
            Err(_) => Err(GobletError::Timeout(format!(
                "upstream operation exceeded {:?}",
                self.timeout
            ))),
        }
    }

    /// Applies whatever the auth collaborator approved forwarding as a
    /// `git -c http.extraHeader=...` flag, the standard way to pass a
    /// one-off `Authorization` header to a `git` subprocess without writing
    /// credentials to a config file or the process environment.
    fn apply_credentials(cmd: &mut Command, credentials: &HashMap<String, String>) {
        if let Some(auth) = credentials.get("authorization") {
            cmd.arg("-c")
                .arg(format!("http.extraHeader=Authorization: {auth}"));
        }
    }

    fn classify_failure(stderr: &str, status_code: Option<i32>) -> GobletError {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("timed out") {
            return GobletError::Timeout(stderr.trim().to_string());
        }
        if lower.contains("could not resolve host")
            || lower.contains("could not connect")
            || lower.contains("connection refused")
        {
            return GobletError::UpstreamNetwork(stderr.trim().to_string());
        }
        if lower.contains("authentication failed")
            || lower.contains("403")
            || lower.contains("401")
            || lower.contains("terminal prompts disabled")
        {
            return GobletError::Unauthorized;
        }
        if let Some(code) = extract_http_status(&lower) {
            return GobletError::UpstreamStatus(code);
        }
        let _ = status_code;
        GobletError::UpstreamProtocol(stderr.trim().to_string())
    }
}

fn extract_http_status(lower: &str) -> Option<u16> {
    // `git` reports origin HTTP failures like "the requested url returned
    // error: 404". Scan for a 3-digit run following "error:" or "status".
    for marker in ["error: ", "status "] {
        if let Some(idx) = lower.find(marker) {
            let rest = &lower[idx + marker.len()..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if digits.len() == 3 {
                if let Ok(code) = digits.parse() {
                    return Some(code);
                }
            }
        }
    }
    None
}

#[async_trait]
impl UpstreamClient for GitUpstreamClient {
    async fn ls_refs(
        &self,
        origin_url: &str,
        credentials: &HashMap<String, String>,
    ) -> Result<Vec<UpstreamRef>, GobletError> {
        let mut cmd = Command::new("git");
        Self::apply_credentials(&mut cmd, credentials);
        cmd.arg("-c")
            .arg("protocol.version=2")
            .arg("ls-remote")
            .arg("--symref")
            .arg(origin_url);
        let output = self.run_with_deadline(cmd).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(
                &String::from_utf8_lossy(&output.stderr),
                output.status.code(),
            ));
        }
        Ok(parse_ls_remote(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn fetch_into_mirror(
        &self,
        origin_url: &str,
        git_dir: &Path,
        credentials: &HashMap<String, String>,
    ) -> Result<(), GobletError> {
        let mut cmd = Command::new("git");
        cmd.arg("--git-dir").arg(git_dir);
        Self::apply_credentials(&mut cmd, credentials);
        cmd.arg("-c")
            .arg("protocol.version=2")
            .arg("fetch")
            .arg("--prune")
            .arg("--quiet")
            .arg(origin_url)
            .arg("+refs/*:refs/mirror/*");
        let output = self.run_with_deadline(cmd).await?;
        if !output.status.success() {
            return Err(Self::classify_failure(
                &String::from_utf8_lossy(&output.stderr),
                output.status.code(),
            ));
        }
        Ok(())
    }
}

fn parse_ls_remote(text: &str) -> Vec<UpstreamRef> {
    let mut symrefs = std::collections::HashMap::new();
    let mut refs = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("ref: ") {
            // `ref: refs/heads/main\tHEAD`
            if let Some((target, name)) = rest.split_once('\t') {
                symrefs.insert(name.to_string(), target.to_string());
            }
            continue;
        }
        if let Some((oid, name)) = line.split_once('\t') {
            refs.push(UpstreamRef {
                name: name.to_string(),
                oid: oid.to_string(),
                symref_target: None,
            });
        }
    }
    for r in refs.iter_mut() {
        if let Some(target) = symrefs.get(&r.name) {
            r.symref_target = Some(target.clone());
        }
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ls_remote_output_with_symref() {
        let text = "ref: refs/heads/main\tHEAD\n\
                     abc123\tHEAD\n\
                     abc123\trefs/heads/main\n\
                     def456\trefs/tags/v1.0\n";
        let refs = parse_ls_remote(text);
        let head = refs.iter().find(|r| r.name == "HEAD").unwrap();
        assert_eq!(head.symref_target.as_deref(), Some("refs/heads/main"));
        assert_eq!(refs.len(), 3);
    }

    #[test]
    fn classifies_network_vs_status_vs_protocol_failures() {
        assert!(matches!(
            GitUpstreamClient::classify_failure("Could not resolve host: example.com", None),
            GobletError::UpstreamNetwork(_)
        ));
        assert!(matches!(
            GitUpstreamClient::classify_failure(
                "fatal: unable to access 'https://x': The requested URL returned error: 404",
                None
            ),
            GobletError::UpstreamStatus(404)
        ));
        assert!(matches!(
            GitUpstreamClient::classify_failure("fatal: protocol error: bad pack", None),
            GobletError::UpstreamProtocol(_)
        ));
    }
}
