//! Error types for delegation-forge
//!
//! Pipeline stages fail with [`PipelineError`]; every variant degrades the
//! current exchange to pass-through. Configuration and CLI edges use
//! [`ConfigError`] and [`ForgeError`].

use thiserror::Error;

/// Main error type for delegation-forge operations
#[derive(Error, Debug)]
pub enum ForgeError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Interception pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Export artifact errors
    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Errors raised by the parse → key → forge → export pipeline
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Malformed delegation token: {0}")]
    MalformedToken(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Delegation chain integrity violated at hop {hop}: {reason}")]
    ChainIntegrity { hop: usize, reason: String },

    #[error("Crypto backend failure: {0}")]
    CryptoBackend(String),

    #[error("Timed out after {0}ms waiting for in-flight key generation")]
    CacheTimeout(u64),
}

impl PipelineError {
    /// Name of the pipeline stage that produced this error
    pub fn stage(&self) -> &'static str {
        match self {
            PipelineError::MalformedToken(_) | PipelineError::UnsupportedAlgorithm(_) => "parser",
            PipelineError::ChainIntegrity { .. } => "forgery",
            PipelineError::CryptoBackend(_) => "crypto",
            PipelineError::CacheTimeout(_) => "keystore",
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        PipelineError::MalformedToken(reason.into())
    }

    pub(crate) fn unsupported(reason: impl Into<String>) -> Self {
        PipelineError::UnsupportedAlgorithm(reason.into())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {path}")]
    ReadError { path: String, source: std::io::Error },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid configuration value: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::ValidationError {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Export artifact errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExportError {
    #[error("Artifact field '{field}' is invalid: {reason}")]
    SchemaViolation { field: String, reason: String },

    #[error("Key material cannot be exported: {0}")]
    KeyMaterial(String),
}

impl ExportError {
    pub(crate) fn schema(field: &str, reason: impl Into<String>) -> Self {
        ExportError::SchemaViolation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl ForgeError {
    /// Create an error with additional context
    pub fn with_context<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ForgeError::WithContext {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ForgeError::Config(e) => format!("Configuration problem: {}", e.user_hint()),
            ForgeError::Pipeline(e) => format!("Forgery skipped: {}", e.user_hint()),
            ForgeError::Export(e) => format!("Artifact rejected: {}", e),
            ForgeError::Io(e) => format!("File system issue: {}", e),
            ForgeError::WithContext { context, source } => format!("{}: {}", context, source),
        }
    }
}

/// Trait for providing user-friendly hints
pub trait UserHint {
    fn user_hint(&self) -> String;
}

impl UserHint for ConfigError {
    fn user_hint(&self) -> String {
        match self {
            ConfigError::ReadError { path, .. } => {
                format!("Could not read '{}'. Check if the file exists and you have read permissions.", path)
            }
            ConfigError::ParseError(_) => {
                "The configuration file has invalid syntax. Check for TOML formatting errors.".into()
            }
            ConfigError::ValidationError { field, reason } => {
                format!("Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl UserHint for PipelineError {
    fn user_hint(&self) -> String {
        match self {
            PipelineError::MalformedToken(_) => {
                "The intercepted delegation could not be decoded; traffic was left untouched.".into()
            }
            PipelineError::UnsupportedAlgorithm(alg) => {
                format!("Key algorithm '{}' cannot be forged; traffic was left untouched.", alg)
            }
            PipelineError::ChainIntegrity { hop, .. } => {
                format!("Delegation {} does not chain to its predecessor; refusing to repair it.", hop)
            }
            PipelineError::CryptoBackend(_) => {
                "The signing backend failed. Check the [crypto] backend setting.".into()
            }
            PipelineError::CacheTimeout(ms) => {
                format!("Key generation for this session took longer than {}ms.", ms)
            }
        }
    }
}

/// Extension trait for adding context to Result types
///
/// Named apart from `anyhow::Context` so both can be in scope.
pub trait ResultExt<T, E> {
    fn forge_context<C>(self, context: C) -> Result<T, ForgeError>
    where
        C: Into<String>;
}

impl<T, E> ResultExt<T, E> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn forge_context<C>(self, context: C) -> Result<T, ForgeError>
    where
        C: Into<String>,
    {
        self.map_err(|e| ForgeError::with_context(context, e))
    }
}
