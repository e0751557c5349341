#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Failed to set up output encoder: {0}")]
    EncoderSetup(String),
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Sparse image error: {0}")]
    SparseError(#[from] crate::sparse::SparseError),
    #[error("Block at {start_block} overlaps or precedes previous block \
        ending at {last_block}")]
    Overlap {
        start_block: u32,
        last_block: u32,
    },
    #[error("Block at {start_block} follows a partial block")]
    PartialBlock {
        start_block: u32,
    },
    #[error("Block at {start_block} spanning {blocks} blocks exceeds image \
        of {total_blocks} blocks")]
    OutOfBounds {
        start_block: u32,
        blocks: u64,
        total_blocks: u64,
    },
    #[error("Output mismatch: declared {declared} {what}, wrote {written}")]
    OutputMismatch {
        what: &'static str,
        declared: u64,
        written: u64,
    },
    #[error("Internal invariant violated: {0}")]
    InvariantViolation(String),
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("Progress template error: {0}")]
    TemplateError(#[from] indicatif::style::TemplateError),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;
