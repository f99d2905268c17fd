//! Incremental decoder for the discovery output stream.
//!
//! A discovery writes its replies and events as a plain sequence of JSON
//! documents: not line-delimited, possibly separated by whitespace, and a
//! single document may arrive split across any number of reads. The
//! decoder buffers bytes until a complete value is available and leaves
//! any unfinished tail for the next read.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::message::Message;

/// Errors produced while decoding the discovery output stream.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Streaming [`Message`] decoder for use with `FramedRead`.
///
/// Yields one [`Message`] per complete JSON value. `Ok(None)` means the
/// buffer holds only a prefix of the next value (or whitespace) and more
/// input is needed; anything that can never become valid JSON is an
/// error and terminates the stream.
#[derive(Debug, Default)]
pub struct MessageDecoder;

impl MessageDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for MessageDecoder {
    type Item = Message;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, DecodeError> {
        let outcome = {
            let mut stream = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Message>();
            match stream.next() {
                Some(Ok(msg)) => Ok(Some((msg, stream.byte_offset()))),
                // A value cut short by the end of the buffer; wait for more.
                Some(Err(e)) if e.is_eof() => Ok(None),
                Some(Err(e)) => Err(DecodeError::Json(e)),
                None => Ok(None),
            }
        };

        match outcome {
            Ok(Some((msg, consumed))) => {
                src.advance(consumed);
                Ok(Some(msg))
            }
            Ok(None) => {
                // Drop a whitespace-only residue so a stream that ends in
                // trailing blanks still reaches a clean EOF.
                if src.iter().all(u8::is_ascii_whitespace) {
                    src.clear();
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
