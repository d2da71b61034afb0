//! Newline framer for the coordinator's serial text stream.
//!
//! The serial link gives no framing guarantee: a read may return half a line or
//! several lines at once. This small incremental framer can be fed arbitrary
//! chunks and yields whole lines when available. It applies a conservative size
//! limit and resynchronizes on runaway input by discarding up to the next
//! terminator.
use bytes::{Buf, BytesMut};
use log::{debug, warn};

use crate::logutil::hex_snippet;

/// Upper bound for a single line (frames are well under 200 bytes in practice)
pub const MAX_LINE_LEN: usize = 512;

pub struct LineFramer {
    buf: BytesMut,
    // Set while skipping the tail of an oversize line.
    discarding: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            discarding: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract the next complete, non-blank line without its terminator
    /// (a trailing `\r` is stripped too). Returns None when no full line is
    /// buffered yet.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > MAX_LINE_LEN {
                    warn!(
                        "Dropping {} unterminated bytes (over {} byte limit)",
                        self.buf.len(),
                        MAX_LINE_LEN
                    );
                    self.buf.clear();
                    self.discarding = true;
                }
                return None;
            };

            let raw = self.buf.split_to(pos);
            self.buf.advance(1); // '\n'

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if raw.len() > MAX_LINE_LEN {
                warn!("Dropping oversize line ({} bytes)", raw.len());
                continue;
            }

            let raw = raw.strip_suffix(b"\r").unwrap_or(&raw[..]);
            if raw.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            match std::str::from_utf8(raw) {
                Ok(text) => return Some(text.to_string()),
                Err(_) => {
                    debug!("Dropping non-UTF-8 line: {}", hex_snippet(raw, 32));
                    continue;
                }
            }
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
