use std::path::PathBuf;

use thiserror::Error;

/// Main error type covering every way a flattening or extraction run can end
#[derive(Error, Debug)]
pub enum FlattenError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The tokenizer rejected the document. Fatal, the stack cannot be rewound.
    #[error("Malformed XML: {message}, line {line}, column {column} ({})", .file.display())]
    MalformedInput {
        file: PathBuf,
        line: u64,
        column: u64,
        message: String,
    },

    #[error("Input not found: {}", .path.display())]
    MissingResource { path: PathBuf },

    #[error("Structural violation: {details}")]
    StructuralViolation { details: String },

    #[error("Duplicate node identity: {type_name} at {path}")]
    DuplicateNode { type_name: String, path: String },

    #[error("Sink write error: {sink} - {source}")]
    SinkIo {
        sink: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid distinguished name: {dn}")]
    InvalidDistinguishedName { dn: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Pipeline deadline exceeded after {seconds:.3} seconds")]
    Timeout { seconds: f64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Concurrent operation error: {details}")]
    Concurrency { details: String },
}

impl FlattenError {
    /// Wrap an I/O failure on a named sink
    pub fn sink_io(sink: impl Into<String>, source: std::io::Error) -> Self {
        FlattenError::SinkIo {
            sink: sink.into(),
            source,
        }
    }

    pub fn structural(details: impl Into<String>) -> Self {
        FlattenError::StructuralViolation {
            details: details.into(),
        }
    }

    /// Cancellation is a clean stop, every other variant is a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlattenError::Cancelled)
    }
}

/// Configuration-specific error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParsing(#[from] toml::de::Error),

    #[error("JSON parsing error: {0}")]
    JsonParsing(#[from] serde_json::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable error: {0}")]
    Environment(String),

    #[error("Unsupported configuration file format: {0}")]
    UnsupportedFormat(String),
}

impl From<ConfigError> for FlattenError {
    fn from(err: ConfigError) -> Self {
        FlattenError::Config(err.to_string())
    }
}

impl From<arrow::error::ArrowError> for FlattenError {
    fn from(err: arrow::error::ArrowError) -> Self {
        FlattenError::structural(format!("Arrow batch assembly failed: {}", err))
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FlattenError>;

/// Configuration result type alias
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
