//! Pkt-line framing: the wire format shared by every Git Smart-HTTP v2
//! request and response.
//!
//! Generalized from the teacher's `protocol::utils::read_pkt_line`, which
//! assumed a single fully-buffered `Bytes` value. Clients may send request
//! bodies in arbitrary chunk sizes, so `PktLineReader` owns a growable
//! buffer and can be fed chunks one at a time.

use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const FLUSH_PKT: &[u8] = b"0000";
pub const DELIM_PKT: &[u8] = b"0001";
pub const RESPONSE_END_PKT: &[u8] = b"0002";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// A data line with its payload (length prefix stripped).
    Data(Bytes),
    /// `0000` — end of a ref/command list.
    Flush,
    /// `0001` — separates sections within a v2 request (e.g. command args).
    Delim,
    /// `0002` — terminates a v2 response section.
    ResponseEnd,
}

#[derive(Debug, thiserror::Error)]
pub enum PktLineError {
    #[error("invalid pkt-line length prefix: {0:?}")]
    InvalidLength(Bytes),
    #[error("pkt-line length {0} is shorter than the 4-byte header")]
    TooShort(usize),
}

/// Incrementally decodes pkt-lines from chunks fed in over time.
#[derive(Debug, Default)]
pub struct PktLineReader {
    buf: BytesMut,
}

impl PktLineReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Attempts to decode the next complete pkt-line from the buffer.
    /// Returns `Ok(None)` if more bytes are needed.
    pub fn next_line(&mut self) -> Result<Option<PktLine>, PktLineError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len_hex = &self.buf[..4];
        let len_str = std::str::from_utf8(len_hex)
            .map_err(|_| PktLineError::InvalidLength(Bytes::copy_from_slice(len_hex)))?;
        let pkt_len = usize::from_str_radix(len_str, 16)
            .map_err(|_| PktLineError::InvalidLength(Bytes::copy_from_slice(len_hex)))?;

        match pkt_len {
            0 => {
                self.buf.advance(4);
                return Ok(Some(PktLine::Flush));
            }
            1 => {
                self.buf.advance(4);
                return Ok(Some(PktLine::Delim));
            }
            2 => {
                self.buf.advance(4);
                return Ok(Some(PktLine::ResponseEnd));
            }
            n if n < 4 => return Err(PktLineError::TooShort(n)),
            _ => {}
        }

        let data_len = pkt_len - 4;
        if self.buf.len() < 4 + data_len {
            return Ok(None);
        }
        self.buf.advance(4);
        let data = self.buf.split_to(data_len).freeze();
        Ok(Some(PktLine::Data(data)))
    }

    /// Drains every fully-buffered line. Stops (without erroring) on the
    /// first incomplete line, leaving it buffered for the next `feed`.
    pub fn drain_available(&mut self) -> Result<Vec<PktLine>, PktLineError> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line()? {
            lines.push(line);
        }
        Ok(lines)
    }
}

pub fn encode_data(buf: &mut BytesMut, payload: &[u8]) {
    let total = payload.len() + 4;
    buf.put_slice(format!("{total:04x}").as_bytes());
    buf.put_slice(payload);
}

pub fn encode_flush(buf: &mut BytesMut) {
    buf.put_slice(FLUSH_PKT);
}

pub fn encode_delim(buf: &mut BytesMut) {
    buf.put_slice(DELIM_PKT);
}

pub fn encode_response_end(buf: &mut BytesMut) {
    buf.put_slice(RESPONSE_END_PKT);
}

/// Side-band stream identifiers used when multiplexing pack data, progress
/// messages, and fatal errors onto a single response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SideBand {
    PackfileData = 1,
    ProgressInfo = 2,
    Error = 3,
}

pub fn encode_sideband(buf: &mut BytesMut, band: SideBand, payload: &[u8]) {
    let total = payload.len() + 5; // 4-byte length + 1 band byte
    buf.put_slice(format!("{total:04x}").as_bytes());
    buf.put_u8(band as u8);
    buf.put_slice(payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_data_and_flush() {
        let mut out = BytesMut::new();
        encode_data(&mut out, b"command=ls-refs\n");
        encode_flush(&mut out);

        let mut reader = PktLineReader::new();
        reader.feed(&out);
        let lines = reader.drain_available().unwrap();
        assert_eq!(
            lines,
            vec![
                PktLine::Data(Bytes::from_static(b"command=ls-refs\n")),
                PktLine::Flush,
            ]
        );
    }

    #[test]
    fn tolerates_arbitrary_chunk_boundaries() {
        let mut out = BytesMut::new();
        encode_data(&mut out, b"0123456789abcdef");
        encode_delim(&mut out);
        encode_response_end(&mut out);
        let whole = out.freeze();

        let mut reader = PktLineReader::new();
        let mut lines = Vec::new();
        for byte in whole.iter() {
            reader.feed(&[*byte]);
            lines.extend(reader.drain_available().unwrap());
        }
        assert_eq!(
            lines,
            vec![
                PktLine::Data(Bytes::from_static(b"0123456789abcdef")),
                PktLine::Delim,
                PktLine::ResponseEnd,
            ]
        );
    }

    #[test]
    fn rejects_length_shorter_than_header() {
        let mut reader = PktLineReader::new();
        reader.feed(b"0003x");
        assert!(matches!(
            reader.next_line(),
            Err(PktLineError::TooShort(3))
        ));
    }

    #[test]
    fn incomplete_line_waits_for_more_bytes() {
        let mut reader = PktLineReader::new();
        reader.feed(b"000a12");
        assert_eq!(reader.next_line().unwrap(), None);
        reader.feed(b"345\n");
        assert_eq!(
            reader.next_line().unwrap(),
            Some(PktLine::Data(Bytes::from_static(b"12345\n")))
        );
    }
}
