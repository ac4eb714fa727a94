use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The scoring arena (index or scorecard) is missing at kernel start.
    #[error("scoring arena is not initialized")]
    InvalidMemory,

    #[error("failed to allocate {0}")]
    BadAlloc(&'static str),

    /// The ready queue yielded a work pointer with no backing buffer.
    #[error("ready queue yielded an empty work pointer")]
    InvalidPointer,

    #[error("malformed query file `{path}` at line {line}: {reason}")]
    Malformed {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
