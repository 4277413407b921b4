/// Reassembles lines from arbitrarily chunked text.
///
/// The trailing incomplete line of a chunk is kept and prepended to the
/// next one. Every complete line is returned exactly once, in order; a
/// trailing `\r` is stripped so CRLF output splits the same way.
#[derive(Debug, Clone, Default)]
pub struct PartialLineBuffer {
    partial: String,
}

impl PartialLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns the lines it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.partial.push_str(chunk);
        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.partial[start..].find('\n') {
            let end = start + offset;
            lines.push(self.partial[start..end].trim_end_matches('\r').to_string());
            start = end + 1;
        }
        self.partial.drain(..start);
        lines
    }

    /// Flushes the buffered remainder at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.partial);
        Some(rest.trim_end_matches('\r').to_string())
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}
