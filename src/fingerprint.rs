//! Request classification and fingerprinting (component E).
//!
//! Parses a v2 `ls-refs`/`fetch` request body (already framed as pkt-lines)
//! into a [`ParsedRequest`], then derives a stable [`Fingerprint`] used as
//! the single-flight dedup key and the freshness cache key.
//!
//! Grounded on the command-parsing loop idiom in the teacher's
//! `protocol::smart::SmartProtocol` (read pkt-lines until flush, split each
//! line on whitespace) generalized from v1 capability tokens to v2
//! `command=`/argument tokens.

use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::GobletError;
use crate::oid::ObjectId;
use crate::pktline::{PktLine, PktLineReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    LsRefs,
    Fetch,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::LsRefs => "ls-refs",
            Command::Fetch => "fetch",
        }
    }
}

/// A classified v2 request. Every argument line is preserved verbatim (not
/// just the ones Goblet understands) so that unknown tokens still affect the
/// fingerprint, per spec: unknown tokens must not collapse into false cache
/// hits.
#[derive(Debug, Clone, Default)]
pub struct ParsedRequest {
    pub command: Option<Command>,
    pub wants: Vec<String>,
    pub haves: Vec<String>,
    pub shallows: Vec<String>,
    pub filters: Vec<String>,
    pub ref_prefixes: Vec<String>,
    pub capabilities: Vec<String>,
    pub other_args: Vec<String>,
    pub done: bool,
}

impl ParsedRequest {
    /// Parses a full v2 request body (already the concatenation of all
    /// bytes the client sent; the HTTP layer buffers the (small) request
    /// body before handing it here, unlike responses which are always
    /// streamed).
    pub fn parse(body: &[u8]) -> Result<Self, GobletError> {
        let mut reader = PktLineReader::new();
        reader.feed(body);
        let lines = reader
            .drain_available()
            .map_err(|e| GobletError::Protocol(e.to_string()))?;

        let mut parsed = ParsedRequest::default();
        let mut first = true;
        for line in lines {
            match line {
                PktLine::Flush | PktLine::Delim | PktLine::ResponseEnd => continue,
                PktLine::Data(data) => {
                    let text = decode_line(&data);
                    if first {
                        first = false;
                        let command = text
                            .strip_prefix("command=")
                            .ok_or_else(|| {
                                GobletError::Protocol(
                                    "v2 request must begin with a command= line".into(),
                                )
                            })?
                            .trim();
                        parsed.command = Some(match command {
                            "ls-refs" => Command::LsRefs,
                            "fetch" => Command::Fetch,
                            other => {
                                return Err(GobletError::Protocol(format!(
                                    "unsupported command: {other}"
                                )));
                            }
                        });
                        continue;
                    }
                    classify_arg(&text, &mut parsed)?;
                }
            }
        }

        if parsed.command.is_none() {
            return Err(GobletError::Protocol("empty request body".into()));
        }
        Ok(parsed)
    }

    /// Computes the canonical fingerprint: a SHA-256 digest over the sorted,
    /// deduplicated argument sets plus the command name. Sorting makes the
    /// fingerprint independent of the order a client happened to send
    /// want/have lines in.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.command.map(Command::as_str).unwrap_or("").as_bytes());
        hasher.update([0u8]);
        for field in [
            &self.wants,
            &self.haves,
            &self.shallows,
            &self.filters,
            &self.ref_prefixes,
            &self.capabilities,
            &self.other_args,
        ] {
            let mut sorted: Vec<&str> = field.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.dedup();
            for item in sorted {
                hasher.update(item.as_bytes());
                hasher.update([0u8]);
            }
            hasher.update([0xffu8]);
        }
        hasher.update([self.done as u8]);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Fingerprint(out)
    }
}

fn decode_line(data: &Bytes) -> String {
    String::from_utf8_lossy(data).trim_end_matches('\n').to_string()
}

/// Validates and extracts the OID argument of a `want`/`have`/`shallow`
/// line. These are the only v2 argument lines that carry an object id; a
/// malformed one (wrong length, non-hex) is a protocol violation rather
/// than something to pass through to `git-upload-pack` and let fail there.
fn parse_oid_arg(kind: &str, v: &str) -> Result<String, GobletError> {
    let oid = ObjectId::parse(v)
        .ok_or_else(|| GobletError::Protocol(format!("malformed {kind} oid: {v:?}")))?;
    Ok(oid.as_str().to_string())
}

fn classify_arg(text: &str, parsed: &mut ParsedRequest) -> Result<(), GobletError> {
    if let Some(v) = text.strip_prefix("want ") {
        parsed.wants.push(parse_oid_arg("want", v.trim())?);
    } else if let Some(v) = text.strip_prefix("have ") {
        parsed.haves.push(parse_oid_arg("have", v.trim())?);
    } else if let Some(v) = text.strip_prefix("shallow ") {
        parsed.shallows.push(parse_oid_arg("shallow", v.trim())?);
    } else if let Some(v) = text.strip_prefix("filter ") {
        parsed.filters.push(v.trim().to_string());
    } else if let Some(v) = text.strip_prefix("ref-prefix ") {
        parsed.ref_prefixes.push(v.trim().to_string());
    } else if text == "done" {
        parsed.done = true;
    } else if text.is_empty() {
        // ignore stray blank lines
    } else if !text.contains(' ') && !text.contains('=') {
        parsed.capabilities.push(text.to_string());
    } else {
        parsed.other_args.push(text.to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pktline::{encode_data, encode_flush};
    use bytes::BytesMut;

    fn build_fetch_body(wants: &[&str]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, b"command=fetch\n");
        encode_data(&mut buf, b"thin-pack\n");
        for w in wants {
            encode_data(&mut buf, format!("want {w}\n").as_bytes());
        }
        encode_data(&mut buf, b"done\n");
        encode_flush(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn parses_fetch_with_wants() {
        let oid = "a".repeat(40);
        let body = build_fetch_body(&[&oid]);
        let parsed = ParsedRequest::parse(&body).unwrap();
        assert_eq!(parsed.command, Some(Command::Fetch));
        assert_eq!(parsed.wants, vec![oid]);
        assert!(parsed.done);
        assert_eq!(parsed.capabilities, vec!["thin-pack".to_string()]);
    }

    #[test]
    fn fingerprint_is_stable_regardless_of_want_order() {
        let a = "a".repeat(40);
        let b = "b".repeat(40);
        let body1 = build_fetch_body(&[&a, &b]);
        let body2 = build_fetch_body(&[&b, &a]);
        let fp1 = ParsedRequest::parse(&body1).unwrap().fingerprint();
        let fp2 = ParsedRequest::parse(&body2).unwrap().fingerprint();
        assert_eq!(fp1.0, fp2.0);
    }

    #[test]
    fn fingerprint_distinguishes_unknown_tokens() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, b"command=fetch\n");
        encode_data(&mut buf, b"want-ref refs/heads/main\n");
        encode_flush(&mut buf);
        let parsed = ParsedRequest::parse(&buf).unwrap();
        assert_eq!(parsed.other_args, vec!["want-ref refs/heads/main".to_string()]);

        let mut buf2 = BytesMut::new();
        encode_data(&mut buf2, b"command=fetch\n");
        encode_flush(&mut buf2);
        let parsed2 = ParsedRequest::parse(&buf2).unwrap();

        assert_ne!(parsed.fingerprint().0, parsed2.fingerprint().0);
    }

    #[test]
    fn rejects_body_not_starting_with_command() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, b"want abcd\n");
        assert!(ParsedRequest::parse(&buf).is_err());
    }

    #[test]
    fn rejects_malformed_want_oid() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, b"command=fetch\n");
        encode_data(&mut buf, b"want not-an-oid\n");
        encode_flush(&mut buf);
        let err = ParsedRequest::parse(&buf).unwrap_err();
        assert!(matches!(err, GobletError::Protocol(_)));
    }

    #[test]
    fn rejects_malformed_have_and_shallow_oid() {
        let oid = "a".repeat(40);
        let mut buf = BytesMut::new();
        encode_data(&mut buf, b"command=fetch\n");
        encode_data(&mut buf, format!("want {oid}\n").as_bytes());
        encode_data(&mut buf, b"have short\n");
        encode_flush(&mut buf);
        assert!(ParsedRequest::parse(&buf).is_err());

        let mut buf2 = BytesMut::new();
        encode_data(&mut buf2, b"command=fetch\n");
        encode_data(&mut buf2, format!("want {oid}\n").as_bytes());
        encode_data(&mut buf2, b"shallow zzzz\n");
        encode_flush(&mut buf2);
        assert!(ParsedRequest::parse(&buf2).is_err());
    }
}
