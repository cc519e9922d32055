//! Frame Reassembler
//!
//! Notifications arrive as arbitrary slices of a newline-terminated JSON
//! stream. The reassembler accumulates them and cuts out every balanced
//! top-level `{...}` span. Partial frames stay buffered for the next
//! fragment; a buffer that grows past the cap is treated as corrupt and
//! dropped whole.

use tracing::{trace, warn};

pub const DEFAULT_BUFFER_CAP: usize = 10 * 1024;

pub struct FrameReassembler {
    buffer: Vec<u8>,
    cap: usize,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAP)
    }
}

impl FrameReassembler {
    pub fn new(cap: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cap,
        }
    }

    /// Append a fragment and return every frame it completed, in stream order.
    pub fn push(&mut self, fragment: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(fragment);

        if self.buffer.len() > self.cap {
            warn!(
                "Frame buffer overflow ({} > {} bytes), discarding",
                self.buffer.len(),
                self.cap
            );
            self.buffer.clear();
            return Vec::new();
        }

        let (spans, consumed) = scan_frames(&self.buffer);
        let mut frames = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            match std::str::from_utf8(&self.buffer[start..end]) {
                Ok(text) => frames.push(text.to_string()),
                Err(e) => warn!("Dropping frame with invalid UTF-8: {}", e),
            }
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        trace!(
            "Reassembler produced {} frame(s), {} byte(s) retained",
            frames.len(),
            self.buffer.len()
        );
        frames
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Find balanced top-level object spans as `(start, end)` byte ranges.
///
/// Returns the spans and the number of leading bytes they account for (up to
/// and including the last closing brace). Braces are ASCII, so every range
/// boundary falls on a UTF-8 character boundary.
fn scan_frames(bytes: &[u8]) -> (Vec<(usize, usize)>, usize) {
    let mut spans = Vec::new();
    let mut consumed = 0;
    let mut depth = 0usize;
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if depth > 0 && in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push((start, i + 1));
                    consumed = i + 1;
                }
            }
            b'"' if depth > 0 => in_string = true,
            _ => {}
        }
    }

    (spans, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const STREAM: &str = "{\"type\":\"netlink\",\"action\":\"device_list\",\"content\":{\"devices\":[{\"name\":\"A\",\"mode\":\"master\"}]}}\n\
{\"type\":\"forward\",\"content\":{\"work_mode\":\"drill\"}}\n\
{\"type\":\"notice\",\"action\":\"ota_prepare\",\"content\":{\"reason\":\"brace } in text\"}}\n";

    fn expected_frames() -> Vec<String> {
        STREAM.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_single_fragment_yields_all_frames() {
        let mut reassembler = FrameReassembler::default();
        assert_eq!(reassembler.push(STREAM.as_bytes()), expected_frames());
        // Trailing newline is retained until the next frame arrives
        assert_eq!(reassembler.buffered_len(), 1);
    }

    #[test]
    fn test_partial_frame_is_held_until_complete() {
        let mut reassembler = FrameReassembler::default();
        assert!(reassembler.push(br#"{"type":"version","#).is_empty());
        assert_eq!(
            reassembler.push(br#""version":"1.2"}{"type""#),
            vec![r#"{"type":"version","version":"1.2"}"#.to_string()]
        );
        assert_eq!(reassembler.buffered_len(), 7);
    }

    #[test]
    fn test_stray_closing_brace_is_skipped() {
        let mut reassembler = FrameReassembler::default();
        assert_eq!(
            reassembler.push(b"}\n{\"a\":1}"),
            vec![r#"{"a":1}"#.to_string()]
        );
    }

    #[test]
    fn test_overflow_discards_buffer_then_recovers() {
        let mut reassembler = FrameReassembler::new(64);
        assert!(reassembler.push(b"{\"never\":\"closed\"").is_empty());
        assert!(reassembler.push(&[b'x'; 64]).is_empty());
        assert_eq!(reassembler.buffered_len(), 0);

        assert_eq!(
            reassembler.push(br#"{"type":"version"}"#),
            vec![r#"{"type":"version"}"#.to_string()]
        );
    }

    #[test]
    fn test_multibyte_text_survives_fragmentation() {
        let frame = r#"{"name":"靶子-ä"}"#;
        let bytes = frame.as_bytes();
        let mut reassembler = FrameReassembler::default();
        // Split inside the first multibyte character
        assert!(reassembler.push(&bytes[..10]).is_empty());
        assert_eq!(reassembler.push(&bytes[10..]), vec![frame.to_string()]);
    }

    #[test]
    fn test_invalid_utf8_frame_is_dropped_alone() {
        let mut reassembler = FrameReassembler::default();
        let mut bytes = b"{\"a\":\"".to_vec();
        bytes.push(0xff);
        bytes.extend_from_slice(b"\"}{\"b\":2}");
        assert_eq!(reassembler.push(&bytes), vec![r#"{"b":2}"#.to_string()]);
    }

    proptest! {
        #[test]
        fn prop_fragmentation_invariance(mut cuts in proptest::collection::vec(0..STREAM.len(), 0..12)) {
            cuts.sort_unstable();
            cuts.dedup();

            let bytes = STREAM.as_bytes();
            let mut reassembler = FrameReassembler::default();
            let mut frames = Vec::new();
            let mut last = 0;
            for cut in cuts.into_iter().chain(std::iter::once(bytes.len())) {
                frames.extend(reassembler.push(&bytes[last..cut]));
                last = cut;
            }

            prop_assert_eq!(frames, expected_frames());
        }
    }
}
