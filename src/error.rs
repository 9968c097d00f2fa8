use std::io;

use thiserror::Error;

use crate::sample::SamplerState;

/// Errors surfaced by the binary codecs and their file I/O.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to open file: {0}")]
    FileOpen(#[source] io::Error),

    #[error("failed to read file: {0}")]
    FileRead(#[source] io::Error),

    #[error("failed to write file: {0}")]
    FileWrite(#[source] io::Error),

    /// The leading magic bytes did not match any known file kind.
    #[error("unrecognized magic 0x{0:08x}")]
    InvalidFormat(u32),

    /// The file was produced by a newer format revision.
    #[error("unsupported format version {0}")]
    VersionMismatch(u16),

    #[error("unsupported compression type {0}")]
    CompressionUnsupported(u8),

    /// A field value is outside its documented bounds.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Decoded entries would exceed the destination map's capacity.
    #[error("decoded entries exceed destination capacity")]
    OutOfCapacity,
}

impl CodecError {
    pub(crate) fn integrity(msg: impl Into<String>) -> Self {
        Self::Integrity(msg.into())
    }
}

/// Errors surfaced by the sampler lifecycle.
///
/// The overflow hot path never reports errors; capacity and depth drops are
/// recorded as counters on the [`Sampler`][crate::sample::Sampler] instead.
#[derive(Debug, Error)]
pub enum SamplerError {
    /// The requested event is not available on this system.
    #[error("performance event not supported on this system")]
    NotSupported,

    #[error("insufficient permission for performance monitoring")]
    Permission,

    /// The operation is not legal in the sampler's current state.
    #[error("operation invalid in sampler state {0:?}")]
    BadState(SamplerState),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("internal sampler failure: {0}")]
    Internal(String),

    /// I/O failure while flushing collected data.
    #[error(transparent)]
    Codec(#[from] CodecError),
}
