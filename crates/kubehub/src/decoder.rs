use bytes::BytesMut;

use kreflect_core::{DecodeError, WatchEvent};

/// Upper bound on a single buffered watch line unless configured otherwise.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Incremental decoder for newline-delimited watch events.
///
/// Bytes are fed in arbitrary chunks; an event is produced only once its line terminator has
/// arrived. Blank lines (keep-alives) are skipped; anything else that fails to decode is an error
/// and the caller must abandon the stream.
#[derive(Debug)]
pub struct EventDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already known to contain no newline.
    scanned: usize,
    max_line: usize,
}

impl Default for EventDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_limit(max_line: usize) -> Self {
        Self { buf: BytesMut::new(), scanned: 0, max_line: max_line.max(1) }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes held back waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete event, or `Ok(None)` when more input is needed.
    pub fn next_event(&mut self) -> Result<Option<WatchEvent>, DecodeError> {
        loop {
            let Some(rel) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
                self.scanned = self.buf.len();
                if self.buf.len() > self.max_line {
                    return Err(DecodeError::LineTooLong { limit: self.max_line });
                }
                return Ok(None);
            };
            let end = self.scanned + rel;
            let line = self.buf.split_to(end + 1);
            self.scanned = 0;
            let line = trim(&line[..end]);
            if line.is_empty() {
                continue;
            }
            if line.len() > self.max_line {
                return Err(DecodeError::LineTooLong { limit: self.max_line });
            }
            return WatchEvent::from_line(line).map(Some);
        }
    }

    /// Drain whatever is left once the server closed the stream.
    ///
    /// A trailing record that is complete JSON is returned; a partial one is reported as
    /// `Truncated` since applying half a record is impossible and skipping it would hide a gap.
    pub fn finish(&mut self) -> Result<Option<WatchEvent>, DecodeError> {
        let rest = self.buf.split();
        self.scanned = 0;
        let line = trim(&rest);
        if line.is_empty() {
            return Ok(None);
        }
        match WatchEvent::from_line(line) {
            Ok(ev) => Ok(Some(ev)),
            Err(DecodeError::InvalidJson { .. }) => Err(DecodeError::Truncated(line.len())),
            Err(e) => Err(e),
        }
    }
}

fn trim(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map(|i| i + 1).unwrap_or(start);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use kreflect_core::EventType;

    const ADDED: &[u8] = br#"{"type":"ADDED","object":{"metadata":{"name":"x","namespace":"d","resourceVersion":"1"}}}"#;

    #[test]
    fn waits_for_terminator_across_chunks() {
        let mut d = EventDecoder::new();
        d.feed(br#"{"type":"ADDED""#);
        assert!(d.next_event().unwrap().is_none());
        d.feed(br#","object":{"metadata":{"name":"x","resourceVersion":"5"}}}"#);
        // complete JSON but no newline yet
        assert!(d.next_event().unwrap().is_none());
        d.feed(b"\n");
        let ev = d.next_event().unwrap().expect("event");
        assert_eq!(ev.event_type, EventType::Added);
        assert_eq!(ev.resource_version, "5");
        assert_eq!(d.buffered(), 0);
    }

    #[test]
    fn several_events_in_one_chunk_and_crlf() {
        let mut d = EventDecoder::new();
        let mut chunk = ADDED.to_vec();
        chunk.extend_from_slice(b"\r\n\n");
        chunk.extend_from_slice(br#"{"type":"BOOKMARK","object":{"metadata":{"resourceVersion":"9"}}}"#);
        chunk.push(b'\n');
        d.feed(&chunk);
        assert_eq!(d.next_event().unwrap().unwrap().event_type, EventType::Added);
        let bm = d.next_event().unwrap().unwrap();
        assert_eq!(bm.event_type, EventType::Bookmark);
        assert_eq!(bm.resource_version, "9");
        assert!(d.next_event().unwrap().is_none());
    }

    #[test]
    fn malformed_line_is_an_error_not_a_skip() {
        let mut d = EventDecoder::new();
        d.feed(b"{not json}\n");
        d.feed(ADDED);
        d.feed(b"\n");
        assert!(matches!(d.next_event(), Err(DecodeError::InvalidJson { .. })));
    }

    #[test]
    fn oversized_line_is_rejected() {
        let mut d = EventDecoder::with_limit(16);
        d.feed(&[b'x'; 32]);
        assert!(matches!(d.next_event(), Err(DecodeError::LineTooLong { limit: 16 })));
    }

    #[test]
    fn finish_reports_partial_tail() {
        let mut d = EventDecoder::new();
        d.feed(br#"{"type":"ADDED","obj"#);
        assert!(d.next_event().unwrap().is_none());
        assert!(matches!(d.finish(), Err(DecodeError::Truncated(_))));

        let mut d = EventDecoder::new();
        d.feed(ADDED);
        assert!(d.finish().unwrap().is_some());
        assert!(d.finish().unwrap().is_none());
    }
}
