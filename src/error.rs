use thiserror::Error;

/// Errors reported by the codec core.
///
/// Warnings (missing SOP/EPH markers, suspicious pass counts) are reported
/// through the `log` facade and never surface here.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Damaged code-stream content: unexpected marker bytes, bad tag tree,
    /// segment length wider than 32 bits, segment overflowing its buffer.
    #[error("corrupt input: {0}")]
    CorruptInput(String),

    /// Index outside the lattice: precinct outside its band, tile outside
    /// the image grid.
    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    /// Parameters that cannot describe a decodable image (zero subsampling,
    /// resolution count out of range, conflicting marker options).
    #[error("inconsistent parameters: {0}")]
    InconsistentParams(String),

    /// A scratch or code-block buffer could not grow to the required size.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),

    /// No slope threshold reaches the requested rate; a best-effort layer
    /// has still been produced.
    #[error("rate control infeasible: {0}")]
    RateControlInfeasible(String),
}

pub type Result<T> = std::result::Result<T, CodecError>;
