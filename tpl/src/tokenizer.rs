//! Line tokenizer for the TPL2 byte stream
//!
//! TCP hands us arbitrary slices of the stream: a read may end in the middle
//! of a line, or carry a whole burst of replies. Bytes are accumulated in a
//! `BytesMut` and complete `\n`-terminated lines are split off; the trailing
//! partial line stays buffered and is prefixed to the next read.

use bytes::{Buf, BytesMut};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Largest partial line kept while waiting for its terminator (1 MiB)
pub const MAX_PENDING_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub struct LineTokenizer {
    buffer: BytesMut,
}

impl Default for LineTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineTokenizer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    /// Append freshly read bytes
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);

        // A runaway line without terminator would grow the buffer forever.
        if self.buffer.len() > MAX_PENDING_BYTES && !self.buffer.contains(&b'\n') {
            tracing::warn!(
                "Discarding {} bytes of unterminated TPL2 input",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    /// Next complete line, without its `\r\n`/`\n` terminator
    ///
    /// Blank lines are skipped. Invalid UTF-8 is replaced rather than
    /// rejected; the parser will classify such lines as unrecognized.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.buffer.iter().position(|&b| b == b'\n')?;
            let raw = self.buffer.split_to(pos + 1);
            let mut end = pos;
            if end > 0 && raw[end - 1] == b'\r' {
                end -= 1;
            }
            let line = String::from_utf8_lossy(&raw[..end]).into_owned();
            if !line.trim().is_empty() {
                return Some(line);
            }
        }
    }

    /// All complete lines currently buffered, in stream order
    pub fn drain_lines(&mut self) -> Vec<String> {
        std::iter::from_fn(|| self.next_line()).collect()
    }

    /// Bytes of the trailing partial line
    pub fn pending_bytes(&self) -> usize {
        self.buffer.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut tokenizer = LineTokenizer::new();
        tokenizer.push(b"1 COMMAND OK\r\n");
        assert_eq!(tokenizer.next_line().as_deref(), Some("1 COMMAND OK"));
        assert_eq!(tokenizer.next_line(), None);
    }

    #[test]
    fn test_partial_line_is_buffered() {
        let mut tokenizer = LineTokenizer::new();
        tokenizer.push(b"5 DATA INLINE X=3.");
        assert!(tokenizer.drain_lines().is_empty());
        assert_eq!(tokenizer.pending_bytes(), 18);

        tokenizer.push(b"14\n5 COMMAND COMP");
        assert_eq!(tokenizer.drain_lines(), vec!["5 DATA INLINE X=3.14"]);

        tokenizer.push(b"LETE\n");
        assert_eq!(tokenizer.drain_lines(), vec!["5 COMMAND COMPLETE"]);
        assert_eq!(tokenizer.pending_bytes(), 0);
    }

    #[test]
    fn test_burst_keeps_order_and_skips_blank_lines() {
        let mut tokenizer = LineTokenizer::new();
        tokenizer.push(b"7 COMMAND OK\r\n\r\n7 DATA INLINE A=1\n\n7 COMMAND COMPLETE\n");
        assert_eq!(
            tokenizer.drain_lines(),
            vec!["7 COMMAND OK", "7 DATA INLINE A=1", "7 COMMAND COMPLETE"]
        );
    }

    #[test]
    fn test_crlf_split_across_reads() {
        let mut tokenizer = LineTokenizer::new();
        tokenizer.push(b"2 COMMAND OK\r");
        assert_eq!(tokenizer.next_line(), None);
        tokenizer.push(b"\n");
        assert_eq!(tokenizer.next_line().as_deref(), Some("2 COMMAND OK"));
    }

    #[test]
    fn test_oversized_unterminated_input_is_discarded() {
        let mut tokenizer = LineTokenizer::new();
        tokenizer.push(&vec![b'x'; MAX_PENDING_BYTES + 1]);
        assert_eq!(tokenizer.pending_bytes(), 0);
    }
}
