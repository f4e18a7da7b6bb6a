//! Framing of watch response bodies
//!
//! A watch body is a sequence of JSON documents, one per event, that may be
//! split across arbitrary chunk boundaries.

use serde::de::IgnoredAny;

use crate::{HubError, Result};

/// Incremental splitter of concatenated JSON documents
#[derive(Debug, Default)]
pub struct JsonFrameDecoder {
    buf: Vec<u8>,
}

impl JsonFrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns every complete document it finished
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<IgnoredAny>();
            loop {
                let start = stream.byte_offset();
                match stream.next() {
                    Some(Ok(_)) => {
                        let end = stream.byte_offset();
                        frames.push(trim_leading_whitespace(&self.buf[start..end]).to_vec());
                        consumed = end;
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        consumed = self.buf.len();
                        break;
                    }
                }
            }
        }

        self.buf.drain(..consumed);
        Ok(frames)
    }

    /// Bytes received that do not yet form a complete document
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Fail if the stream ended in the middle of a document
    pub fn finish(&self) -> Result<()> {
        if trim_leading_whitespace(&self.buf).is_empty() {
            Ok(())
        } else {
            Err(HubError::InvalidRequest(format!(
                "watch stream ended with {} bytes of a partial event",
                self.buf.len()
            )))
        }
    }
}

fn trim_leading_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}
