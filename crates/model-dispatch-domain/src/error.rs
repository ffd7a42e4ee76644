use thiserror::Error;

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum DispatchError {
    #[error("shape error: {field}: {reason}")]
    Shape { field: String, reason: String },
    #[error("missing field: {field}")]
    MissingField { field: String },
    #[error("bounds error: {bound}: {detail}")]
    Bounds { bound: String, detail: String },
    #[error("unknown reference: {}", ids.join(", "))]
    UnknownReference { ids: Vec<String> },
    #[error("integrity error: envelope_id mismatch (expected {expected}, got {actual}); possible tampering or reordered steps")]
    Integrity { expected: String, actual: String },
    #[error("resource error: {limit}: {detail}")]
    Resource { limit: String, detail: String },
}

impl DispatchError {
    pub fn shape(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Shape {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn bounds(bound: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Bounds {
            bound: bound.into(),
            detail: detail.into(),
        }
    }

    pub fn resource(limit: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Resource {
            limit: limit.into(),
            detail: detail.into(),
        }
    }

    /// Stable machine-readable code for the error category.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Shape { .. } => "shape_error",
            Self::MissingField { .. } => "missing_field",
            Self::Bounds { .. } => "bounds_error",
            Self::UnknownReference { .. } => "unknown_reference",
            Self::Integrity { .. } => "integrity_error",
            Self::Resource { .. } => "resource_error",
        }
    }
}
