//! Error types for conversion and container operations

use thiserror::Error;

/// Main error type for all I/O manager operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no converter accepts '{0}'")]
    NoConverter(String),

    #[error("no mesh converter for extension '{0}'")]
    NoMeshConverter(String),

    #[error("read failure: {0}")]
    Read(String),

    #[error("write failure: {0}")]
    Write(String),

    #[error("could not open '{0}'")]
    Open(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("incompatible inputs: {0}")]
    Incompatible(String),

    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    #[error("syntax error at {line}:{col}: {msg}")]
    Syntax { line: u32, col: u32, msg: String },

    #[error("multiple inputs are only supported for UVF targets")]
    MultiInputToNative,

    #[error("invalid format: {0}")]
    Format(String),

    #[error("unsupported container version: {0}.{1}")]
    UnsupportedVersion(u16, u16),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Specialized Result type for I/O manager operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
