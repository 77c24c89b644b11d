//! Shared streaming utilities for LLM providers

/// Server-Sent Events (SSE) decoder
///
/// Buffers incoming bytes and extracts complete SSE `data:` payloads,
/// including events split across chunks and a final event without a
/// trailing newline (via [`SseDecoder::finish`]).
///
/// # Example
/// ```
/// use analyst_chat::llm::streaming::SseDecoder;
///
/// let mut decoder = SseDecoder::new();
/// assert!(decoder.push(b"data: {\"text\"").is_empty());
/// assert_eq!(decoder.push(b":\"hi\"}\n\n"), vec!["{\"text\":\"hi\"}"]);
/// ```
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push incoming bytes and return every completed `data:` payload
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut payloads = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline_pos).collect();
            if let Some(payload) = Self::data_payload(&line) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Flush whatever is left once the byte stream has ended
    pub fn finish(&mut self) -> Vec<String> {
        let payloads = self
            .buffer
            .lines()
            .filter_map(Self::data_payload)
            .collect();
        self.buffer.clear();
        payloads
    }

    fn data_payload(line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        line.strip_prefix("data:").map(|p| p.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_events_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let payloads = decoder.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"text\":\"hel").is_empty());
        assert_eq!(decoder.push(b"lo\"}\n\n"), vec!["{\"text\":\"hello\"}"]);
    }

    #[test]
    fn test_non_data_lines_ignored() {
        let mut decoder = SseDecoder::new();
        let payloads =
            decoder.push(b": comment\ndata: {\"x\":1}\nevent: message\ndata: {\"y\":2}\n\n");
        assert_eq!(payloads, vec!["{\"x\":1}", "{\"y\":2}"]);
    }

    #[test]
    fn test_finish_flushes_and_clears() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\":1}\r\n\r\ndata: {\"b\":2}").len() == 1);
        assert_eq!(decoder.finish(), vec!["{\"b\":2}"]);
        assert!(decoder.finish().is_empty());
    }
}
