use facet::Shape;
use thiserror::Error;

/// Boxed error returned by user marshal hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by compilation and encoding.
///
/// Everything is reported synchronously to the caller; nothing is retried.
/// Option validation runs before any byte is emitted, so an
/// [`Error::InvalidOption`] guarantees an untouched sink.
#[derive(Debug, Error)]
pub enum Error {
    /// The value handed to [`Encoder::encode`](crate::Encoder::encode) is
    /// not of the type the encoder was built for.
    #[error("incompatible value type: encoder expects {expected}, got {actual}")]
    TypeMismatch {
        /// Shape the encoder was created for.
        expected: &'static Shape<'static>,
        /// Shape of the value that was passed in.
        actual: &'static Shape<'static>,
    },

    /// The type cannot be encoded to JSON (function pointers, opaque
    /// shapes, …). Detected at compile time.
    #[error("unsupported type: {0}")]
    UnsupportedType(&'static Shape<'static>),

    /// The value cannot be represented in JSON (NaN, ±Inf, a timestamp
    /// outside year 0..=9999, a malformed number literal).
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// A user marshal hook failed. The original error is preserved and
    /// reachable through [`std::error::Error::source`].
    #[error("marshaler error for type {shape}: {source}")]
    Marshaler {
        /// Shape of the type whose hook failed.
        shape: &'static Shape<'static>,
        /// The error returned by the hook.
        #[source]
        source: BoxError,
    },

    /// A per-call option carries an invalid value.
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// The sink failed while the output was being flushed to it.
    #[error("write error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn marshaler(shape: &'static Shape<'static>, source: BoxError) -> Self {
        Error::Marshaler { shape, source }
    }

    pub(crate) fn invalid_option(msg: impl Into<String>) -> Self {
        Error::InvalidOption(msg.into())
    }

    pub(crate) fn unsupported_value(msg: impl Into<String>) -> Self {
        Error::UnsupportedValue(msg.into())
    }
}
