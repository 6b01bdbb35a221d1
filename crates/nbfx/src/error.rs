use nbfx_buffers::BufferError;
use thiserror::Error;

/// Error type for binary infoset encoding/decoding operations.
///
/// Every error is fatal for the session that raised it: the only valid next
/// step is to close and discard the decoder or encoder together with its
/// byte source. There is no resynchronization below this layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NbfxError {
    /// Malformed record byte or byte sequence.
    #[error("invalid record format")]
    InvalidFormat,
    /// The source ran out of bytes in the middle of a record.
    #[error("unexpected end of input")]
    UnexpectedEndOfInput,
    /// A dictionary key was referenced that neither the static nor the
    /// session table defines.
    #[error("undefined dictionary key {0}")]
    UndefinedDictionaryKey(u32),
    /// A numeric conversion would not fit the requested type.
    #[error("value overflows the requested type")]
    Overflow,
    /// The active value variant cannot convert to the requested type.
    #[error("value cannot convert to the requested type")]
    TypeMismatch,
    /// The session was closed and can no longer be used.
    #[error("session is closed")]
    UseAfterClose,
    /// The caller drove the encoder through an invalid sequence of writes.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    /// The underlying stream failed during a refill.
    #[error("i/o error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl From<BufferError> for NbfxError {
    fn from(err: BufferError) -> Self {
        match err {
            BufferError::EndOfBuffer => NbfxError::UnexpectedEndOfInput,
            BufferError::InvalidUtf8 => NbfxError::InvalidFormat,
        }
    }
}

impl From<std::io::Error> for NbfxError {
    fn from(err: std::io::Error) -> Self {
        NbfxError::Io(err.kind())
    }
}
