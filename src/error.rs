//! Error types for the compression middleware.

use std::io;

/// Boxed error used by user-supplied callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for compression operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while configuring or running the middleware.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An option was rejected while building the layer.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A compression level outside the range supported by the codec.
    #[error("invalid {encoding} compression level {level}")]
    InvalidLevel {
        /// Encoding the level was given for.
        encoding: &'static str,
        /// The rejected level.
        level: i32,
    },

    /// A compressor provider could not produce a working encoder.
    #[error("{encoding}: encoder initialization failed: {source}")]
    ProviderInit {
        /// Encoding of the failing provider.
        encoding: String,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// The per-request minimum size resolver failed.
    #[error("cannot resolve minimum size for request: {0}")]
    MinSize(#[source] BoxError),

    /// The encoder failed while compressing or closing.
    #[error("{encoding}: {source}")]
    Encoder {
        /// Encoding in use when the failure happened.
        encoding: String,
        /// Underlying failure.
        #[source]
        source: io::Error,
    },

    /// The wrapped response body yielded an error.
    #[error("response body error: {0}")]
    Body(#[source] BoxError),

    /// A write was attempted after the response was finalized.
    #[error("write after close")]
    Closed,
}

impl Error {
    pub(crate) fn encoder(encoding: &str, source: io::Error) -> Self {
        Error::Encoder {
            encoding: encoding.to_owned(),
            source,
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::other(err)
    }
}
