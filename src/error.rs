use thiserror::Error as ThisError;
use uuid::Uuid as UUID;

/// Boxed error raised inside a codec, carried as the source of the
/// [`DmError::Codec`] and [`DmError::DeferredLoad`] variants.
pub type CodecSourceError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DmError>;

/// All failures the object model and codec layer can surface.
#[derive(Debug, ThisError)]
pub enum DmError {
    /// A value kind outside the permitted set, or a typed accessor asked
    /// for a kind other than the one stored.
    #[error("attribute type mismatch: expected {expected}, got {found}")]
    AttributeType { expected: String, found: String },

    /// An element or element array was assigned across datamodel
    /// boundaries.
    #[error("element {element} is not owned by this datamodel")]
    ElementOwnership { element: UUID },

    /// An element id collided at creation or import.
    #[error("element id {0} already exists in this datamodel")]
    ElementIdInUse(UUID),

    /// A codec failed while encoding or decoding a stream.
    #[error("{codec} codec error: {source}")]
    Codec {
        codec: String,
        #[source]
        source: CodecSourceError,
    },

    /// A bound codec failed while lazily decoding a single attribute.
    #[error("{codec} codec failed decoding attribute \"{attribute}\" of element {element}: {source}")]
    DeferredLoad {
        codec: String,
        attribute: String,
        element: UUID,
        #[source]
        source: CodecSourceError,
    },

    /// No codec is registered under the requested encoding and version.
    #[error("no codec registered for encoding \"{encoding}\" version {version}")]
    CodecNotFound { encoding: String, version: i32 },

    /// The stream header was present but unparseable.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value type constructor or parse received out-of-domain input.
    #[error("value domain error: {0}")]
    ValueDomain(String),

    /// State misuse, such as re-parenting an attached element array or
    /// force-loading an attribute that is already materialized.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DmError {
    pub(crate) fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::AttributeType {
            expected: expected.into(),
            found: found.into(),
        }
    }

    pub(crate) fn domain(msg: impl Into<String>) -> Self {
        Self::ValueDomain(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let id = UUID::nil();
        let err = DmError::ElementOwnership { element: id };
        assert!(err.to_string().contains("00000000-0000-0000-0000-000000000000"));

        let err = DmError::CodecNotFound {
            encoding: "binary".to_string(),
            version: 9,
        };
        assert!(err.to_string().contains("binary"));
        assert!(err.to_string().contains('9'));
    }
}
