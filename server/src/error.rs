use crate::sanitize::{OrderArgsError, SanitizeError};
use thiserror::Error;

/// Bug in server-side game code. Never reported to the client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefectError {
    #[error("{type_name}.{function} is declared but has no implementation")]
    MissingFunction { type_name: String, function: String },

    #[error("invalidate hook for {type_name}.{function} amended args into an invalid set: {source}")]
    AmendedArgs {
        type_name: String,
        function: String,
        source: SanitizeError,
    },

    #[error("{type_name}.{function} returned a value outside its declared type: {source}")]
    BadReturn {
        type_name: String,
        function: String,
        source: SanitizeError,
    },
}

/// Why an order's future failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderError {
    /// Server code built an order the schema does not allow
    #[error("could not order: {0}")]
    Malformed(#[from] OrderArgsError),

    #[error("client disconnected: {0}")]
    Disconnected(String),
}

/// Transport failure on a client connection
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    Codec(#[from] bincode::Error),

    #[error("packet of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),
}
