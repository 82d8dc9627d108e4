//! Error handling for segcore
//!
//! Every fallible operation returns [`Result`]. Variants are split into
//! caller contract violations (bad ids, missing representations, geometry
//! mismatches) and expected situations (nothing to convert, empty results).

use thiserror::Error;

/// Result type alias for segcore operations
pub type Result<T> = std::result::Result<T, SegError>;

/// Main error type for segcore operations
#[derive(Error, Debug)]
pub enum SegError {
    // Argument Errors
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Segment not found: {segment_id}")]
    SegmentNotFound { segment_id: String },

    #[error("Segment '{segment_id}' has no '{representation}' representation")]
    MissingRepresentation {
        segment_id: String,
        representation: String,
    },

    #[error("Representation '{representation}' has unexpected payload type (expected {expected})")]
    WrongRepresentationType {
        representation: String,
        expected: &'static str,
    },

    // Geometry Errors
    #[error("Geometry mismatch: {reason}")]
    GeometryMismatch { reason: String },

    #[error("Empty extent: {reason}")]
    EmptyExtent { reason: String },

    #[error("Matrix is not invertible")]
    SingularMatrix,

    // Conversion Errors
    #[error("No conversion path from '{source_name}' to '{target}'")]
    NoConversionPath { source_name: String, target: String },

    #[error("Source and target representation are the same: '{representation}'")]
    SameRepresentation { representation: String },

    #[error("Conversion rule '{rule}' failed: {reason}")]
    ConversionFailed { rule: String, reason: String },

    #[error("Unknown conversion parameter: {name}")]
    UnknownParameter { name: String },

    // Layer Errors
    #[error("Layer operation failed: {reason}")]
    LayerError { reason: String },

    // Parse Errors
    #[error("Failed to parse {what}: {reason}")]
    Parse { what: &'static str, reason: String },

    // I/O Errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SegError {
    /// Get the error code for this error type
    pub fn error_code(&self) -> &'static str {
        match self {
            SegError::InvalidArgument { .. } => "INVALID_ARGUMENT",
            SegError::SegmentNotFound { .. } => "SEGMENT_NOT_FOUND",
            SegError::MissingRepresentation { .. } => "MISSING_REPRESENTATION",
            SegError::WrongRepresentationType { .. } => "WRONG_REPRESENTATION_TYPE",
            SegError::GeometryMismatch { .. } => "GEOMETRY_MISMATCH",
            SegError::EmptyExtent { .. } => "EMPTY_EXTENT",
            SegError::SingularMatrix => "SINGULAR_MATRIX",
            SegError::NoConversionPath { .. } => "NO_CONVERSION_PATH",
            SegError::SameRepresentation { .. } => "SAME_REPRESENTATION",
            SegError::ConversionFailed { .. } => "CONVERSION_FAILED",
            SegError::UnknownParameter { .. } => "UNKNOWN_PARAMETER",
            SegError::LayerError { .. } => "LAYER_ERROR",
            SegError::Parse { .. } => "PARSE_ERROR",
            SegError::Io(_) => "IO_ERROR",
            SegError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Check if this error is a caller contract violation
    ///
    /// Contract violations are logged at error level; everything else is an
    /// expected situation and is logged as a warning.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            SegError::InvalidArgument { .. }
                | SegError::SegmentNotFound { .. }
                | SegError::MissingRepresentation { .. }
                | SegError::WrongRepresentationType { .. }
                | SegError::GeometryMismatch { .. }
                | SegError::SameRepresentation { .. }
                | SegError::SingularMatrix
        )
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        SegError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn segment_not_found(segment_id: &str) -> Self {
        SegError::SegmentNotFound {
            segment_id: segment_id.to_string(),
        }
    }

    pub(crate) fn missing_representation(segment_id: &str, representation: &str) -> Self {
        SegError::MissingRepresentation {
            segment_id: segment_id.to_string(),
            representation: representation.to_string(),
        }
    }

    pub(crate) fn conversion(rule: &str, reason: impl Into<String>) -> Self {
        SegError::ConversionFailed {
            rule: rule.to_string(),
            reason: reason.into(),
        }
    }

    /// Log this error at the severity its category calls for
    pub(crate) fn log(&self, context: &str) {
        if self.is_contract_violation() {
            tracing::error!(code = self.error_code(), "{}: {}", context, self);
        } else {
            tracing::warn!(code = self.error_code(), "{}: {}", context, self);
        }
    }
}
