mod executor;
mod config;

pub use executor::Runtime;
pub use config::RuntimeConfig;

use thiserror::Error;
use crate::bytecode::{CodecError, TextError};
use crate::utils::FileError;
use crate::vm::{LoadError, VMError};

/// Errors that can occur in the runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("VM error: {0}")]
    VMError(#[from] VMError),

    #[error("Load error: {0}")]
    LoadError(#[from] LoadError),

    #[error("Tape decoding error: {0}")]
    CodecError(#[from] CodecError),

    #[error("Tape assembly error: {0}")]
    TextError(#[from] TextError),

    #[error("{0}")]
    FileError(#[from] FileError),

    #[error("Runtime configuration error: {0}")]
    ConfigError(String),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
