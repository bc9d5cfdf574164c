use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::error::{ProcessError, ProcessResult};

/// One decoded line of output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLine {
    /// Line text without the terminator
    pub text: String,
    /// Zero-based position of the line in the stream
    pub sequence: u64,
}

/// Splits a byte stream into UTF-8 lines
///
/// Bytes are buffered until a newline arrives, so a multi-byte character
/// split across reads is decoded whole. A final unterminated line is
/// returned at end of stream.
pub struct LineDecoder<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    sequence: u64,
}

impl<R: AsyncRead + Unpin> LineDecoder<R> {
    /// Create a decoder over `reader`
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            buf: Vec::new(),
            sequence: 0,
        }
    }

    /// Number of lines produced so far
    pub fn lines_read(&self) -> u64 {
        self.sequence
    }

    /// Read the next line, or `None` at end of stream
    pub async fn next_line(&mut self) -> ProcessResult<Option<DecodedLine>> {
        self.buf.clear();

        let n = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(ProcessError::Read)?;

        if n == 0 {
            return Ok(None);
        }

        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        }

        let sequence = self.sequence;
        let text = String::from_utf8(std::mem::take(&mut self.buf)).map_err(|source| {
            ProcessError::Decode {
                line: sequence,
                source,
            }
        })?;

        self.sequence += 1;
        Ok(Some(DecodedLine { text, sequence }))
    }
}
