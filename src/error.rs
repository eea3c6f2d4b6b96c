//! Typed error conditions that callers need to tell apart.
//!
//! Everything else in the crate travels as [`anyhow::Error`]; these enums
//! ride inside it and can be recovered with `err.downcast_ref::<T>()`.
use thiserror::Error;

/// Feature-store and tensor-container errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeatureStoreError {
    /// A required entry (e.g. `raw_signals`) is absent from the container.
    #[error("'{key}' entry not found in {file}")]
    MissingEntry {
        /// Entry key that was looked up.
        key: String,
        /// Container the lookup was made against.
        file: String,
    },

    /// Entry has a rank or extent different from what the layout requires.
    #[error("entry '{key}' has shape {got:?}, expected {expected}")]
    ShapeMismatch {
        /// Entry key.
        key: String,
        /// Shape found on disk.
        got: Vec<usize>,
        /// Human-readable description of the expected shape.
        expected: String,
    },

    /// Entry stored with a dtype this reader does not decode.
    #[error("entry '{key}' has unsupported dtype {dtype}")]
    UnsupportedDtype {
        /// Entry key.
        key: String,
        /// Dtype tag from the header.
        dtype: String,
    },
}

/// Malformed EDF/EDF+ header.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EdfError {
    /// File shorter than the fixed 256-byte header.
    #[error("EDF file too small: {len} bytes")]
    Truncated {
        /// Actual file length.
        len: usize,
    },

    /// A numeric ASCII header field failed to parse.
    #[error("EDF header field '{field}' is not a number: {value:?}")]
    BadField {
        /// Field name.
        field: &'static str,
        /// Raw field text.
        value: String,
    },

    /// No signal in the file carries sample data.
    #[error("EDF file has no data signals")]
    NoSignals,
}

/// Sequence-model errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Input tensor does not match the model's configured input shape.
    #[error("input shape {got:?} does not match model input [batch, {channels}, {length}]")]
    InputShape {
        /// Shape passed in.
        got: Vec<usize>,
        /// Configured input channels.
        channels: usize,
        /// Configured input length.
        length: usize,
    },

    /// Checkpoint lacks a parameter the architecture needs.
    #[error("checkpoint is missing parameter '{0}'")]
    MissingParameter(String),

    /// Checkpoint parameter has the wrong shape for this architecture.
    #[error("parameter '{name}' has shape {got:?}, expected {expected:?}")]
    ParameterShape {
        /// Parameter name.
        name: String,
        /// Shape in the checkpoint.
        got: Vec<usize>,
        /// Shape the architecture expects.
        expected: Vec<usize>,
    },
}
