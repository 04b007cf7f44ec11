//! Response materializer (component F).
//!
//! `ls-refs` is cheap and fully specified, so Goblet builds that response
//! itself from [`MirrorStore::refs`]. `fetch` is delegated to a real
//! `git-upload-pack --stateless-rpc` subprocess against the mirror — the
//! simplest way to match upstream git's own shallow/filter/thin-pack/
//! sideband behavior is to *be* it, per `SPEC_FULL.md` §4.F. Grounded on
//! `examples/http_server.rs`'s streaming-subprocess-to-response pattern.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::GobletError;
use crate::fingerprint::ParsedRequest;
use crate::mirror::{MirrorHandle, MirrorRef, MirrorStore};
use crate::pktline::{encode_data, encode_flush};

pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<Bytes, GobletError>> + Send>>;

/// Builds the protocol v2 capability advertisement (flush-terminated), per
/// the wire-protocol contract: `version=2`, `agent=…`, `ls-refs`,
/// `fetch=shallow filter ref-in-want sideband-all`, `server-option`,
/// `object-format=sha1`. Unknown client capabilities are ignored elsewhere
/// (`fingerprint::classify_arg`); this is purely what Goblet advertises.
pub fn capability_advertisement() -> Bytes {
    let mut out = BytesMut::new();
    encode_data(&mut out, b"version 2\n");
    encode_data(
        &mut out,
        format!("agent=goblet/{}\n", env!("CARGO_PKG_VERSION")).as_bytes(),
    );
    encode_data(&mut out, b"ls-refs\n");
    encode_data(&mut out, b"fetch=shallow filter ref-in-want sideband-all\n");
    encode_data(&mut out, b"server-option\n");
    encode_data(&mut out, b"object-format=sha1\n");
    encode_flush(&mut out);
    out.freeze()
}

/// Builds the pkt-line `ls-refs` response, honoring `ref-prefix` filters.
/// Peeled tags and symref targets (notably `HEAD`) are emitted inline per
/// the v2 wire format.
pub async fn ls_refs(
    store: &MirrorStore,
    handle: &MirrorHandle,
    request: &ParsedRequest,
) -> Result<Bytes, GobletError> {
    let refs = store.refs(handle).await?;
    let mut out = BytesMut::new();

    let wants_symrefs = request.capabilities.iter().any(|c| c == "symrefs");
    let wants_peel = request.capabilities.iter().any(|c| c == "peel");

    for r in filter_refs(&refs, &request.ref_prefixes) {
        let mut line = format!("{} {}", r.oid, r.name);
        if wants_symrefs {
            if let Some(target) = &r.symref_target {
                line.push_str(&format!(" symref-target:{target}"));
            }
        }
        if wants_peel {
            if let Some(peeled) = &r.peeled {
                line.push_str(&format!(" peeled:{peeled}"));
            }
        }
        line.push('\n');
        encode_data(&mut out, line.as_bytes());
    }
    encode_flush(&mut out);
    Ok(out.freeze())
}

fn filter_refs<'a>(refs: &'a [MirrorRef], prefixes: &[String]) -> Vec<&'a MirrorRef> {
    if prefixes.is_empty() {
        return refs.iter().collect();
    }
    refs.iter()
        .filter(|r| prefixes.iter().any(|p| r.name.starts_with(p.as_str())))
        .collect()
}

/// Streams a `fetch` response by piping `body` to `git-upload-pack
/// --stateless-rpc` and forwarding its stdout chunk by chunk. Never buffers
/// the full pack in memory.
pub async fn fetch_stream(handle: &MirrorHandle, body: Bytes) -> Result<ResponseStream, GobletError> {
    let mut child = Command::new("git")
        .arg("upload-pack")
        .arg("--stateless-rpc")
        .arg(&handle.git_dir)
        .env("GIT_PROTOCOL", "version=2")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| GobletError::Internal(format!("spawning git-upload-pack: {e}")))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| GobletError::Internal("git-upload-pack stdin missing".into()))?;
    stdin
        .write_all(&body)
        .await
        .map_err(|e| GobletError::Internal(format!("writing request to git-upload-pack: {e}")))?;
    drop(stdin);

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| GobletError::Internal("git-upload-pack stdout missing".into()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| GobletError::Internal("git-upload-pack stderr missing".into()))?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, GobletError>>(16);

    tokio::spawn(async move {
        let mut buf = [0u8; 64 * 1024];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Err(GobletError::Internal(format!(
                            "reading git-upload-pack stdout: {e}"
                        ))))
                        .await;
                    return;
                }
            }
        }

        match child.wait().await {
            Ok(status) if !status.success() => {
                let mut err_text = String::new();
                let _ = stderr.read_to_string(&mut err_text).await;
                let _ = tx
                    .send(Err(GobletError::Internal(format!(
                        "git-upload-pack exited with {status}: {err_text}"
                    ))))
                    .await;
            }
            Err(e) => {
                let _ = tx
                    .send(Err(GobletError::Internal(format!(
                        "waiting on git-upload-pack: {e}"
                    ))))
                    .await;
            }
            _ => {}
        }
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::RepositoryId;

    fn mirror_ref(name: &str, oid: &str) -> MirrorRef {
        MirrorRef {
            name: name.to_string(),
            oid: oid.to_string(),
            symref_target: None,
            peeled: None,
        }
    }

    #[test]
    fn filter_refs_respects_prefixes() {
        let refs = vec![
            mirror_ref("refs/heads/main", &"a".repeat(40)),
            mirror_ref("refs/tags/v1", &"b".repeat(40)),
        ];
        let filtered = filter_refs(&refs, &["refs/heads/".to_string()]);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "refs/heads/main");
    }

    #[test]
    fn capability_advertisement_lists_the_required_set() {
        let advertisement = capability_advertisement();
        let text = String::from_utf8_lossy(&advertisement);
        for required in [
            "version 2",
            "ls-refs",
            "fetch=shallow filter ref-in-want sideband-all",
            "server-option",
            "object-format=sha1",
        ] {
            assert!(text.contains(required), "missing {required:?} in {text:?}");
        }
        assert!(advertisement.ends_with(b"0000"));
    }

    #[tokio::test]
    async fn ls_refs_emits_flush_terminated_response() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MirrorStore::new(tmp.path().to_path_buf());
        let id = RepositoryId::new("https/example.com/foo.git".to_string());
        let handle = store.open_or_create(&id).await.unwrap();

        let request = ParsedRequest {
            command: Some(crate::fingerprint::Command::LsRefs),
            ..Default::default()
        };
        let response = ls_refs(&store, &handle, &request).await.unwrap();
        assert_eq!(&response[response.len() - 4..], b"0000");
    }
}
