/// Splits a byte stream into trimmed text lines.
///
/// Chunks read from a pipe are not aligned on line boundaries, so the incomplete tail of a
/// chunk is kept until the next one completes it. Both `\n` and `\r` end a line, since tools
/// that redraw a progress line only emit carriage returns.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, skipping blank ones.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let Some(last_newline_pos) = self.pending.iter().rposition(|&b| b == b'\n' || b == b'\r')
        else {
            return Vec::new();
        };

        let rest = self.pending.split_off(last_newline_pos + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete
            .split(|&b| b == b'\n' || b == b'\r')
            .filter_map(decode_line)
            .collect()
    }

    /// Flush the unterminated tail once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest)
    }
}

fn decode_line(bytes: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(bytes);
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_partial_line_until_completed() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"INFO:     Uvicorn run").is_empty());
        assert_eq!(
            buffer.push(b"ning on http://127.0.0.1:8153\nINFO: next"),
            vec!["INFO:     Uvicorn running on http://127.0.0.1:8153"]
        );
        assert_eq!(buffer.finish().as_deref(), Some("INFO: next"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn splits_on_carriage_returns_and_skips_blank_lines() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"[download]  1.0%\r[download]  2.0%\r\n\n   \n");
        assert_eq!(lines, vec!["[download]  1.0%", "[download]  2.0%"]);
    }

    #[test]
    fn multibyte_characters_split_across_chunks() {
        let mut buffer = LineBuffer::new();
        let text = "caf\u{e9} ready\n".as_bytes();
        let (head, tail) = text.split_at(4);
        assert!(buffer.push(head).is_empty());
        assert_eq!(buffer.push(tail), vec!["caf\u{e9} ready"]);
    }
}
