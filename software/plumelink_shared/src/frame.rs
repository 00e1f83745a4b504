//! Accumulation of raw bytes into terminator-delimited frames.

use crate::TERMINATOR;

/// Growable byte buffer that splits off complete frames.
///
/// `scanned` marks how far the buffer is already known to hold no
/// terminator, so each new chunk only costs a search over the new bytes
/// plus a terminator-length overlap.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    scanned: usize,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Whether a complete frame is waiting, without consuming it.
    pub fn has_frame(&mut self) -> bool {
        self.find_terminator().is_some()
    }

    /// Split off the next complete frame as text, leaving any remainder
    /// buffered for the next call.
    pub fn next_frame(&mut self) -> Option<String> {
        let end = self.find_terminator()?;
        let text = String::from_utf8_lossy(&self.buf[..end]).into_owned();
        self.buf.drain(..end + TERMINATOR.len());
        self.scanned = 0;
        Some(text)
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    fn find_terminator(&mut self) -> Option<usize> {
        let start = self.scanned.saturating_sub(TERMINATOR.len() - 1);
        let found = self.buf[start..]
            .windows(TERMINATOR.len())
            .position(|w| w == TERMINATOR)
            .map(|i| start + i);
        if found.is_none() {
            self.scanned = self.buf.len();
        }
        found
    }
}
