//! Splits a chunked byte stream into newline-terminated lines.

/// Incremental line splitter.
///
/// Chunks may end anywhere, including inside a UTF-8 sequence; bytes are
/// buffered until a `\n` arrives, so a line is only yielded once complete.
#[derive(Debug, Default)]
pub struct LineFramer {
    pending: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning the lines it completed, in order.
    ///
    /// The terminator (`\n`, and a preceding `\r`) is stripped. Invalid
    /// UTF-8 is replaced lossily and left for the decoder to reject.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];

            let line = if self.pending.is_empty() {
                decode(head)
            } else {
                self.pending.extend_from_slice(head);
                let line = decode(&self.pending);
                self.pending.clear();
                line
            };
            lines.push(line);
        }

        self.pending.extend_from_slice(rest);
        lines
    }

    /// Bytes of the current unterminated fragment.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// End of stream: discard any unterminated fragment.
    ///
    /// Returns the number of bytes dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }
}

fn decode(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
