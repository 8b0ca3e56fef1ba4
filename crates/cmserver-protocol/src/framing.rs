//! Marker-delimited message framing.
//!
//! Every message travels between a literal open and close marker:
//!
//! ```text
//! \n[== "CMake Server" ==[\n
//! {"type":"hello", ...}
//! \n]== "CMake Server" ==]\n
//! ```
//!
//! The framer matches markers syntactically and never looks inside the
//! payload; JSON decoding happens on the extracted text.

use serde::Serialize;
use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};
use crate::{CLOSE_MARKER, DEFAULT_MAX_BUFFER_SIZE, OPEN_MARKER};

/// Wraps `message` in the framing markers.
///
/// # Example
///
/// ```rust
/// use cmserver_protocol::{encode_message, MessageFramer};
///
/// let bytes = encode_message(&serde_json::json!({"type": "compute"})).unwrap();
/// let mut framer = MessageFramer::new();
/// let payloads = framer.feed(&bytes).unwrap();
/// assert_eq!(payloads, vec![r#"{"type":"compute"}"#.to_string()]);
/// ```
pub fn encode_message<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_string(message)?;
    if json.contains(OPEN_MARKER) || json.contains(CLOSE_MARKER) {
        return Err(ProtocolError::MarkerInPayload);
    }

    let mut buffer = Vec::with_capacity(json.len() + OPEN_MARKER.len() + CLOSE_MARKER.len() + 4);
    buffer.push(b'\n');
    buffer.extend_from_slice(OPEN_MARKER.as_bytes());
    buffer.push(b'\n');
    buffer.extend_from_slice(json.as_bytes());
    buffer.push(b'\n');
    buffer.extend_from_slice(CLOSE_MARKER.as_bytes());
    buffer.push(b'\n');
    Ok(buffer)
}

/// Incremental extractor of framed payloads from an append-only byte stream.
///
/// Partial frames stay buffered across [`feed`](Self::feed) calls; bytes
/// outside any frame are discarded.
#[derive(Debug)]
pub struct MessageFramer {
    buffer: Vec<u8>,
    /// Start of the current frame body, once its open marker has been seen.
    body_start: Option<usize>,
    /// Where the next marker search resumes.
    scan_from: usize,
    max_buffer_size: usize,
}

impl Default for MessageFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFramer {
    /// Creates a framer with the default buffer bound.
    pub fn new() -> Self {
        Self::with_max_buffer_size(DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Creates a framer that fails once more than `max` bytes are buffered.
    pub fn with_max_buffer_size(max: usize) -> Self {
        Self {
            buffer: Vec::new(),
            body_start: None,
            scan_from: 0,
            max_buffer_size: max,
        }
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends `chunk` and returns every payload completed by it, in order.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Utf8`] if a payload is not UTF-8 and
    /// [`ProtocolError::BufferOverflow`] if the pending data exceeds the bound.
    pub fn feed(&mut self, chunk: &[u8]) -> ProtocolResult<Vec<String>> {
        self.buffer.extend_from_slice(chunk);
        let mut payloads = Vec::new();

        loop {
            let body_start = match self.body_start {
                Some(start) => start,
                None => match find(&self.buffer, OPEN_MARKER.as_bytes(), self.scan_from) {
                    Some(at) => {
                        let start = at + OPEN_MARKER.len();
                        self.body_start = Some(start);
                        self.scan_from = start;
                        start
                    }
                    None => {
                        self.discard_noise();
                        break;
                    }
                },
            };

            match find(&self.buffer, CLOSE_MARKER.as_bytes(), self.scan_from) {
                Some(at) => {
                    let body = self.buffer[body_start..at].to_vec();
                    let text = String::from_utf8(body)?;
                    payloads.push(text.trim().to_string());

                    self.buffer.drain(..at + CLOSE_MARKER.len());
                    self.body_start = None;
                    self.scan_from = 0;
                }
                None => {
                    self.scan_from = resume_point(self.buffer.len(), CLOSE_MARKER.len())
                        .max(body_start);
                    break;
                }
            }
        }

        if self.buffer.len() > self.max_buffer_size {
            return Err(ProtocolError::BufferOverflow {
                size: self.buffer.len(),
                max: self.max_buffer_size,
            });
        }

        Ok(payloads)
    }

    /// Drops bytes that cannot belong to a frame, keeping a possible partial
    /// open marker at the tail.
    fn discard_noise(&mut self) {
        let keep_from = resume_point(self.buffer.len(), OPEN_MARKER.len());
        if keep_from > 0 {
            let noise = &self.buffer[..keep_from];
            if noise.iter().any(|b| !b.is_ascii_whitespace()) {
                trace!(bytes = keep_from, "discarding bytes outside any frame");
            }
            self.buffer.drain(..keep_from);
        }
        self.scan_from = 0;
    }
}

/// First index at which a marker of `marker_len` bytes could still complete.
fn resume_point(len: usize, marker_len: usize) -> usize {
    len.saturating_sub(marker_len - 1)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || haystack.len() - from < needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| pos + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &str) -> Vec<u8> {
        format!("\n{OPEN_MARKER}\n{payload}\n{CLOSE_MARKER}\n").into_bytes()
    }

    #[test]
    fn encode_wraps_json_in_markers() {
        #[derive(Serialize)]
        struct Probe {
            #[serde(rename = "type")]
            kind: &'static str,
            cookie: &'static str,
        }

        let bytes = encode_message(&Probe {
            kind: "compute",
            cookie: "7",
        })
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        insta::assert_snapshot!(text.trim(), @r#"
        [== "CMake Server" ==[
        {"type":"compute","cookie":"7"}
        ]== "CMake Server" ==]
        "#);
    }

    #[test]
    fn byte_by_byte_feed_yields_one_payload() {
        let payload = r#"{"type":"hello","supportedProtocolVersions":[{"major":1,"minor":1}]}"#;
        let bytes = frame(payload);

        let mut framer = MessageFramer::new();
        let mut out = Vec::new();
        for b in &bytes {
            out.extend(framer.feed(std::slice::from_ref(b)).unwrap());
        }

        assert_eq!(out, vec![payload.to_string()]);
        assert_eq!(framer.buffered(), 1); // trailing newline
    }

    #[test]
    fn several_envelopes_in_one_chunk_come_out_in_order() {
        let mut bytes = Vec::new();
        for i in 0..5 {
            bytes.extend(frame(&format!(r#"{{"type":"message","message":"m{i}"}}"#)));
        }

        let mut framer = MessageFramer::new();
        let out = framer.feed(&bytes).unwrap();
        assert_eq!(out.len(), 5);
        for (i, payload) in out.iter().enumerate() {
            assert!(payload.contains(&format!("m{i}")));
        }
    }

    #[test]
    fn split_at_every_offset_matches_whole_feed() {
        let payload = r#"{"type":"reply","cookie":"1","inReplyTo":"compute"}"#;
        let bytes = frame(payload);

        for split in 0..=bytes.len() {
            let mut framer = MessageFramer::new();
            let mut out = framer.feed(&bytes[..split]).unwrap();
            out.extend(framer.feed(&bytes[split..]).unwrap());
            assert_eq!(out, vec![payload.to_string()], "split at {split}");
        }
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let bytes = frame(r#"{"type":"compute"}"#);
        let mut framer = MessageFramer::new();

        assert!(framer.feed(&bytes[..bytes.len() - 5]).unwrap().is_empty());
        assert!(framer.buffered() > 0);
        assert_eq!(framer.feed(&bytes[bytes.len() - 5..]).unwrap().len(), 1);
    }

    #[test]
    fn noise_between_frames_is_dropped() {
        let mut bytes = b"garbage before\n".to_vec();
        bytes.extend(frame(r#"{"type":"a"}"#));
        bytes.extend(b"more noise");
        bytes.extend(frame(r#"{"type":"b"}"#));

        let mut framer = MessageFramer::new();
        let out = framer.feed(&bytes).unwrap();
        assert_eq!(out, vec![r#"{"type":"a"}"#, r#"{"type":"b"}"#]);
    }

    #[test]
    fn unterminated_frame_overflows_the_bound() {
        let mut framer = MessageFramer::with_max_buffer_size(128);
        let mut bytes = format!("{OPEN_MARKER}\n").into_bytes();
        bytes.extend(std::iter::repeat_n(b'x', 200));

        let result = framer.feed(&bytes);
        assert!(matches!(
            result,
            Err(ProtocolError::BufferOverflow { max: 128, .. })
        ));
    }

    #[test]
    fn noise_alone_never_overflows() {
        let mut framer = MessageFramer::with_max_buffer_size(64);
        for _ in 0..100 {
            assert!(framer.feed(b"no markers in this line\n").unwrap().is_empty());
        }
        assert!(framer.buffered() < OPEN_MARKER.len());
    }

    #[test]
    fn invalid_utf8_payload_is_an_error() {
        let mut bytes = format!("{OPEN_MARKER}\n").into_bytes();
        bytes.extend([0xff, 0xfe]);
        bytes.extend(format!("\n{CLOSE_MARKER}").into_bytes());

        let mut framer = MessageFramer::new();
        assert!(matches!(framer.feed(&bytes), Err(ProtocolError::Utf8(_))));
    }
}
