use thiserror::Error;

use crate::frame::FrameHeader;
use crate::tier::Tier;

/// Errors raised while assembling or parsing a binary frame.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame truncated: needed {needed} more bytes in {context}")]
    Truncated { context: &'static str, needed: usize },

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: u64 },

    #[error("{field} too long for its length prefix: {len}")]
    TooLong { field: &'static str, len: usize },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("header declares {declared} payload bytes, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unsupported ECC parameters: {0}")]
    EccParameters(String),

    #[error("more symbol errors than parity can correct (block {block})")]
    EccUncorrectable {
        block: usize,
        /// Best-effort, uncorrected frame contents.
        degraded: Box<DegradedFrame>,
    },
}

/// What a caller gets back when Reed–Solomon correction fails: the header and
/// the raw, uncorrected section bytes.
#[derive(Debug, Clone)]
pub struct DegradedFrame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    pub degraded: bool,
}

/// Pipeline-stage errors. All are local and non-retryable.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("tier mismatch: routing metadata says {metadata:?}, header says {header:?}")]
    TierMismatch { metadata: Tier, header: Tier },

    #[error("priority {0} outside 1..=10")]
    InvalidPriority(u8),

    #[error("invalid pipeline config: {0}")]
    Config(String),

    #[error("frame error: {0}")]
    Frame(#[from] CodecError),
}

impl PipelineError {
    /// The best-effort frame when the error is an uncorrectable ECC failure.
    pub fn degraded_frame(&self) -> Option<&DegradedFrame> {
        match self {
            PipelineError::Frame(CodecError::EccUncorrectable { degraded, .. }) => Some(degraded),
            _ => None,
        }
    }

    pub fn is_ecc_uncorrectable(&self) -> bool {
        self.degraded_frame().is_some()
    }
}
