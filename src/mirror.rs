//! Mirror store (component B): the on-disk bare-repository cache.
//!
//! Grounded on `examples/http_server.rs`'s `FsRepository`, which implements
//! `RepositoryAccess` entirely by shelling to the system `git` binary
//! (`git_cmd`, `run_git`). Goblet generalizes that idiom into a registry of
//! open mirrors (spec §9) keyed by [`RepositoryId`], each backed by a real
//! `git init --bare` repository so that `git-upload-pack` (see
//! `materializer`) can serve real packs directly from it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use path_absolutize::Absolutize;
use tokio::process::Command;

use crate::canonical::RepositoryId;
use crate::error::{GobletError, UpstreamOutcome};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MirrorMetadata {
    pub last_update_utc: chrono::DateTime<chrono::Utc>,
    pub last_upstream_status: UpstreamOutcome,
    #[serde(default)]
    pub last_fingerprints_seen: Vec<String>,
}

impl Default for MirrorMetadata {
    fn default() -> Self {
        MirrorMetadata {
            last_update_utc: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            last_upstream_status: UpstreamOutcome::Ok,
            last_fingerprints_seen: Vec::new(),
        }
    }
}

const MAX_REMEMBERED_FINGERPRINTS: usize = 64;

impl MirrorMetadata {
    pub fn remember_fingerprint(&mut self, fp: String) {
        self.last_fingerprints_seen.push(fp);
        if self.last_fingerprints_seen.len() > MAX_REMEMBERED_FINGERPRINTS {
            self.last_fingerprints_seen.remove(0);
        }
    }
}

/// A ref as reported by `git for-each-ref`.
#[derive(Debug, Clone)]
pub struct MirrorRef {
    pub name: String,
    pub oid: String,
    pub symref_target: Option<String>,
    pub peeled: Option<String>,
}

/// A single open mirror: its on-disk location plus persisted freshness
/// metadata, kept in memory once opened so repeated requests for the same
/// repository don't re-read `meta.json` from disk.
#[derive(Debug)]
pub struct MirrorHandle {
    pub id: RepositoryId,
    pub git_dir: PathBuf,
    pub metadata: tokio::sync::RwLock<MirrorMetadata>,
}

impl MirrorHandle {
    fn meta_path(&self) -> PathBuf {
        self.git_dir.join(".goblet").join("meta.json")
    }

    pub async fn load_metadata(&self) -> MirrorMetadata {
        let path = self.meta_path();
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => MirrorMetadata::default(),
        }
    }

    /// Atomic write-then-rename, matching the write-fully-then-move
    /// discipline the teacher uses for loose objects and pack config.
    pub async fn persist_metadata(&self) -> Result<(), GobletError> {
        let meta = self.metadata.read().await.clone();
        let dir = self.git_dir.join(".goblet");
        tokio::fs::create_dir_all(&dir).await?;
        let bytes = serde_json::to_vec_pretty(&meta)
            .map_err(|e| GobletError::Internal(format!("serializing mirror metadata: {e}")))?;

        let tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tokio::fs::write(tmp.path(), &bytes).await?;
        let final_path = self.meta_path();
        tmp.persist(&final_path)
            .map_err(|e| GobletError::Internal(format!("renaming mirror metadata: {e}")))?;
        Ok(())
    }
}

fn git_command(git_dir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("--git-dir").arg(git_dir);
    cmd.kill_on_drop(true);
    cmd
}

/// Registry of open mirrors, keyed by canonical repository id.
pub struct MirrorStore {
    cache_root: PathBuf,
    open: DashMap<RepositoryId, Arc<MirrorHandle>, ahash::RandomState>,
}

impl MirrorStore {
    pub fn new(cache_root: PathBuf) -> Self {
        MirrorStore {
            cache_root,
            open: DashMap::default(),
        }
    }

    fn mirror_path(&self, id: &RepositoryId) -> Result<PathBuf, GobletError> {
        let relative = id.relative_mirror_path();
        let joined = self.cache_root.join(relative);
        joined
            .absolutize()
            .map(|p| p.to_path_buf())
            .map_err(|e| GobletError::Internal(format!("resolving mirror path: {e}")))
    }

    /// Opens an already-open mirror, or creates a fresh bare repository on
    /// disk and registers it.
    pub async fn open_or_create(&self, id: &RepositoryId) -> Result<Arc<MirrorHandle>, GobletError> {
        if let Some(existing) = self.open.get(id) {
            return Ok(existing.clone());
        }

        let git_dir = self.mirror_path(id)?;
        let exists = tokio::fs::metadata(&git_dir).await.is_ok();
        if !exists {
            tokio::fs::create_dir_all(&git_dir).await?;
            let status = Command::new("git")
                .arg("init")
                .arg("--bare")
                .arg("--quiet")
                .arg(&git_dir)
                .kill_on_drop(true)
                .status()
                .await?;
            if !status.success() {
                return Err(GobletError::Internal(format!(
                    "git init --bare failed for {}",
                    id
                )));
            }
            // Stock git defaults both of these to off; without them
            // `git-upload-pack --stateless-rpc` silently ignores `filter`
            // and `want-ref` even though the capability advertisement
            // claims to support them.
            for (key, value) in [
                ("uploadpack.allowFilter", "true"),
                ("uploadpack.allowRefInWant", "true"),
            ] {
                let status = git_command(&git_dir)
                    .arg("config")
                    .arg(key)
                    .arg(value)
                    .status()
                    .await?;
                if !status.success() {
                    return Err(GobletError::Internal(format!(
                        "git config {key}={value} failed for {}",
                        id
                    )));
                }
            }
        }

        let handle = Arc::new(MirrorHandle {
            id: id.clone(),
            git_dir,
            metadata: tokio::sync::RwLock::new(MirrorMetadata::default()),
        });
        {
            let loaded = handle.load_metadata().await;
            *handle.metadata.write().await = loaded;
        }

        self.open.insert(id.clone(), handle.clone());
        Ok(handle)
    }

    pub fn is_open(&self, id: &RepositoryId) -> bool {
        self.open.contains_key(id)
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Number of mirrors currently open in this process, for
    /// `goblet_repos_total`.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Lists refs via `git for-each-ref`, already lexicographically ordered
    /// by the OS call itself (verified by the `--format` contract, not
    /// re-sorted redundantly).
    pub async fn refs(&self, handle: &MirrorHandle) -> Result<Vec<MirrorRef>, GobletError> {
        let output = git_command(&handle.git_dir)
            .arg("for-each-ref")
            .arg("--format=%(objectname) %(refname) %(symref) %(*objectname)")
            .output()
            .await?;
        if !output.status.success() {
            return Err(GobletError::CacheCorruption {
                repository: handle.id.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let mut refs = Vec::new();
        for line in text.lines() {
            let mut parts = line.splitn(4, ' ');
            let oid = parts.next().unwrap_or_default().to_string();
            let name = parts.next().unwrap_or_default().to_string();
            let symref = parts.next().unwrap_or_default();
            let peeled = parts.next().unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            refs.push(MirrorRef {
                name,
                oid,
                symref_target: if symref.is_empty() {
                    None
                } else {
                    Some(symref.to_string())
                },
                peeled: if peeled.is_empty() {
                    None
                } else {
                    Some(peeled.to_string())
                },
            });
        }
        Ok(refs)
    }

    pub async fn has_object(&self, handle: &MirrorHandle, oid: &str) -> Result<bool, GobletError> {
        let status = git_command(&handle.git_dir)
            .arg("cat-file")
            .arg("-e")
            .arg(oid)
            .status()
            .await?;
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::RepositoryId;

    #[tokio::test]
    async fn open_or_create_initializes_bare_repo_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path().to_path_buf());
        let id = RepositoryId::new("https/example.com/foo.git".to_string());

        let first = store.open_or_create(&id).await.unwrap();
        assert!(first.git_dir.join("HEAD").exists());

        let second = store.open_or_create(&id).await.unwrap();
        assert_eq!(first.git_dir, second.git_dir);
        assert!(store.is_open(&id));
    }

    #[tokio::test]
    async fn open_or_create_enables_filter_and_ref_in_want() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path().to_path_buf());
        let id = RepositoryId::new("https/example.com/filterable.git".to_string());
        let handle = store.open_or_create(&id).await.unwrap();

        for key in ["uploadpack.allowFilter", "uploadpack.allowRefInWant"] {
            let output = git_command(&handle.git_dir)
                .arg("config")
                .arg("--get")
                .arg(key)
                .output()
                .await
                .unwrap();
            assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "true");
        }
    }

    #[tokio::test]
    async fn refs_on_empty_mirror_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path().to_path_buf());
        let id = RepositoryId::new("https/example.com/bar.git".to_string());
        let handle = store.open_or_create(&id).await.unwrap();
        let refs = store.refs(&handle).await.unwrap();
        assert!(refs.is_empty());
    }

    #[tokio::test]
    async fn metadata_round_trips_through_atomic_write() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path().to_path_buf());
        let id = RepositoryId::new("https/example.com/baz.git".to_string());
        let handle = store.open_or_create(&id).await.unwrap();

        {
            let mut meta = handle.metadata.write().await;
            meta.last_upstream_status = UpstreamOutcome::Ok;
            meta.remember_fingerprint("abc123".to_string());
        }
        handle.persist_metadata().await.unwrap();

        let reloaded = handle.load_metadata().await;
        assert_eq!(reloaded.last_fingerprints_seen, vec!["abc123".to_string()]);
    }
}
