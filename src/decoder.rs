use serde::de::DeserializeOwned;
use tracing::debug;

/// Outcome of decoding one protocol line. Malformed diagnostic output
/// from a worker is reported as `Skipped`, never as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T> {
    Parsed(T),
    Skipped,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("worker output line exceeded {limit} bytes")]
    LineTooLong { limit: usize },
}

/// Incremental splitter for newline-delimited output arriving in
/// arbitrary-sized chunks. Retains the trailing partial line between
/// pushes; the retained fragment is capped so a worker that never
/// prints a newline cannot grow the buffer without bound.
///
/// The buffer is kept as bytes and converted per complete line, so a
/// multi-byte character split across chunk boundaries decodes intact.
#[derive(Debug)]
pub struct LineDecoder {
    buf: Vec<u8>,
    limit: usize,
}

impl LineDecoder {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Consume a chunk and return the complete lines it finished, in
    /// arrival order. Fails only when the retained partial line
    /// outgrows the cap; that is fatal for the stream.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, DecodeError> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            lines.push(String::from_utf8_lossy(&self.buf[start..end]).into_owned());
            start = end + 1;
        }
        self.buf.drain(..start);

        if self.buf.len() > self.limit {
            return Err(DecodeError::LineTooLong { limit: self.limit });
        }
        Ok(lines)
    }

    /// Flush the trailing unterminated fragment at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        Some(line)
    }
}

/// Decode one line of worker output. Empty and whitespace-only lines
/// are skipped, as is anything that is not a JSON object of the
/// expected shape.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Decoded<T> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Decoded::Skipped;
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => Decoded::Parsed(value),
        Err(e) => {
            debug!(error = %e, line = trimmed, "Skipping unparseable worker output line");
            Decoded::Skipped
        }
    }
}
