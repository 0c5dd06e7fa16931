//! SSE frame decoding for the analysis event stream
//!
//! The stream is one-directional text over a persistent chunked response:
//! records separated by a blank line, each carrying a `data:` line with one
//! JSON-encoded envelope. This decoder owns only the framing; JSON decoding
//! and malformed-record policy live with the stream reader.

use tracing::debug;

/// Incremental decoder from raw response chunks to `data` payload strings
///
/// Chunk boundaries are arbitrary: a record may span chunks and a chunk may
/// carry several records. Bytes are buffered until a complete record (blank
/// line) is seen, so multi-byte UTF-8 sequences split across chunks are safe.
#[derive(Debug, Default)]
pub struct SseFrameDecoder {
    buf: Vec<u8>,
}

impl SseFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of bytes, returning the `data` payload of every record
    /// completed by it
    ///
    /// Comment lines (leading `:`) and non-`data` fields are ignored. Records
    /// with no `data` line (e.g. heartbeat comments) produce nothing.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(end) = find_record_end(&self.buf) {
            let record: Vec<u8> = self.buf.drain(..end.record_len).collect();
            self.buf.drain(..end.separator_len);
            let text = String::from_utf8_lossy(&record);
            if let Some(data) = extract_data(&text) {
                payloads.push(data);
            } else {
                debug!("SSE: record without data field, skipping");
            }
        }
        payloads
    }

    /// Bytes of an incomplete trailing record still buffered
    ///
    /// Non-zero at clean EOF means the stream was cut mid-record; the
    /// fragment is dropped, never decoded.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

struct RecordEnd {
    record_len: usize,
    separator_len: usize,
}

/// Locate the first blank-line separator ("\n\n" or "\r\n\r\n")
fn find_record_end(buf: &[u8]) -> Option<RecordEnd> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if i + 1 < buf.len() && buf[i + 1] == b'\n' {
                return Some(RecordEnd {
                    record_len: i,
                    separator_len: 2,
                });
            }
            if i + 2 < buf.len() && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
                return Some(RecordEnd {
                    record_len: i,
                    separator_len: 3,
                });
            }
        }
        i += 1;
    }
    None
}

/// Join the record's `data:` lines into one payload string
fn extract_data(record: &str) -> Option<String> {
    let mut lines = Vec::new();
    for line in record.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}
