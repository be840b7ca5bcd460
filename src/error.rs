//! Comprehensive error types for the whisperd service operations.
//!
//! This module defines the `WhisperdError` enum covering all error conditions
//! that can occur during task persistence, model pool management, media
//! retrieval, engine invocation, and callback delivery.
//!
//! It also provides helper methods to construct errors and generate
//! user-friendly messages.
use thiserror::Error;

/// Represents all possible errors in the whisperd service.
///
/// Each variant provides specific context to facilitate debugging and
/// user-friendly reporting.
///
/// # Examples
///
/// ```rust
/// use whisperd::error::{WhisperdError, WhisperdResult};
///
/// fn example() -> WhisperdResult<()> {
///     Err(WhisperdError::Engine {
///         engine: "faster_whisper".to_string(),
///         message: "runtime returned malformed segments".to_string(),
///     })
/// }
/// ```
///
/// # Exit Codes
///
/// Each error variant maps to an exit code via `WhisperdError::exit_code`.
#[derive(Error, Debug)]
pub enum WhisperdError {
    /// I/O operation failed during file system access.
    ///
    /// This variant wraps `std::io::Error` and provides context about
    /// file operations that failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error due to invalid or missing settings.
    ///
    /// Contains a human-readable message describing the issue.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error
        message: String,
    },

    /// Task store error: the database rejected an operation or the
    /// connection could not be (re)established.
    #[error("Task store error: {message}")]
    Store {
        /// Detailed error message describing the issue
        message: String,
    },

    /// Invalid submission from the caller (missing input, both inputs
    /// present, malformed URL, disallowed file type, oversized file).
    #[error("Invalid submission: {message}")]
    InvalidSubmission {
        /// Description of what the caller got wrong
        message: String,
    },

    /// The transcription engine itself raised during a call.
    ///
    /// Engine errors are terminal for the task; the core never retries them.
    #[error("Engine error [{engine}]: {message}")]
    Engine {
        /// Engine name ("openai_whisper", "faster_whisper")
        engine: String,
        /// Raw error message from the engine
        message: String,
    },

    /// No model handle became available within the acquisition timeout and
    /// the pool is at its maximum size.
    #[error("Model pool exhausted, and all models are currently in use")]
    PoolExhausted,

    /// Media could not be fetched or failed validation.
    #[error("Media fetch error: {message}")]
    MediaFetch {
        /// Description of the download or validation failure
        message: String,
    },

    /// Audio probing failed (unreadable container, no audio track).
    #[error("Audio probe error: {message}")]
    AudioProbe {
        /// Description of the probing failure
        message: String,
    },

    /// Indicates that the specified file was not found.
    #[error("File not found: {0}")]
    FileNotFound(String),
    /// Invalid file name encountered.
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),
    /// A path escaped the configured temp root or was a symlink.
    #[error("Unsafe path rejected: {0}")]
    UnsafePath(std::path::PathBuf),
    /// Generic file operation failure with message.
    #[error("File operation failed: {0}")]
    FileOperationFailed(String),
    /// Generic command execution error.
    #[error("{0}")]
    CommandExecution(String),

    /// The requested task does not exist.
    #[error("Task not found: {0}")]
    TaskNotFound(i64),

    /// Unsupported media type encountered.
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    /// Catch-all error variant wrapping any other failure.
    #[error("Unknown error: {0}")]
    Other(#[from] anyhow::Error),
}

// Convert reqwest error to media fetch error; the callback dispatcher and
// engine clients wrap their own failures with richer context before this
// fallback applies.
impl From<reqwest::Error> for WhisperdError {
    fn from(err: reqwest::Error) -> Self {
        WhisperdError::MediaFetch {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for WhisperdError {
    fn from(err: sqlx::Error) -> Self {
        WhisperdError::Store {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for WhisperdError {
    fn from(err: url::ParseError) -> Self {
        WhisperdError::InvalidSubmission {
            message: format!("malformed URL: {}", err),
        }
    }
}

impl From<symphonia::core::errors::Error> for WhisperdError {
    fn from(err: symphonia::core::errors::Error) -> Self {
        WhisperdError::audio_probe(err.to_string())
    }
}

// Convert config crate error to configuration error
impl From<config::ConfigError> for WhisperdError {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound(path) => WhisperdError::Config {
                message: format!("Configuration file not found: {}", path),
            },
            config::ConfigError::Message(msg) => WhisperdError::Config { message: msg },
            _ => WhisperdError::Config {
                message: format!("Configuration error: {}", err),
            },
        }
    }
}

impl From<serde_json::Error> for WhisperdError {
    fn from(err: serde_json::Error) -> Self {
        WhisperdError::Store {
            message: format!("JSON serialization/deserialization error: {}", err),
        }
    }
}

/// Specialized `Result` type for whisperd operations.
pub type WhisperdResult<T> = Result<T, WhisperdError>;

impl WhisperdError {
    /// Create a configuration error with the given message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use whisperd::error::WhisperdError;
    /// let err = WhisperdError::config("invalid setting");
    /// assert_eq!(err.to_string(), "Configuration error: invalid setting");
    /// ```
    pub fn config<S: Into<String>>(message: S) -> Self {
        WhisperdError::Config {
            message: message.into(),
        }
    }

    /// Create a task store error with the given message.
    pub fn store<S: Into<String>>(message: S) -> Self {
        WhisperdError::Store {
            message: message.into(),
        }
    }

    /// Create an invalid-submission error with the given message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use whisperd::error::WhisperdError;
    /// let err = WhisperdError::invalid_submission("either a file or a file_url is required");
    /// assert!(err.to_string().contains("file_url"));
    /// ```
    pub fn invalid_submission<S: Into<String>>(message: S) -> Self {
        WhisperdError::InvalidSubmission {
            message: message.into(),
        }
    }

    /// Create an engine error for the given engine and message.
    pub fn engine<S1, S2>(engine: S1, message: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        WhisperdError::Engine {
            engine: engine.into(),
            message: message.into(),
        }
    }

    /// Create a media fetch error with the given message.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use whisperd::error::WhisperdError;
    /// let err = WhisperdError::media_fetch("connection reset");
    /// assert_eq!(err.to_string(), "Media fetch error: connection reset");
    /// ```
    pub fn media_fetch<S: Into<String>>(message: S) -> Self {
        WhisperdError::MediaFetch {
            message: message.into(),
        }
    }

    /// Create an audio probe error with the given message.
    pub fn audio_probe<S: Into<String>>(message: S) -> Self {
        WhisperdError::AudioProbe {
            message: message.into(),
        }
    }

    /// Return the corresponding exit code for this error variant.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use whisperd::error::WhisperdError;
    /// assert_eq!(WhisperdError::config("x").exit_code(), 2);
    /// ```
    pub fn exit_code(&self) -> i32 {
        match self {
            WhisperdError::Io(_) => 1,
            WhisperdError::Config { .. } => 2,
            WhisperdError::Store { .. } => 3,
            WhisperdError::Engine { .. } => 4,
            WhisperdError::PoolExhausted => 5,
            WhisperdError::MediaFetch { .. } => 6,
            WhisperdError::InvalidSubmission { .. } => 7,
            _ => 1,
        }
    }

    /// Return a user-friendly error message with suggested remedies.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use whisperd::error::WhisperdError;
    /// let msg = WhisperdError::config("missing key").user_friendly_message();
    /// assert!(msg.contains("Configuration error:"));
    /// ```
    pub fn user_friendly_message(&self) -> String {
        match self {
            WhisperdError::Io(e) => format!("File operation error: {}", e),
            WhisperdError::Config { message } => format!(
                "Configuration error: {}\nHint: run 'whisperd config --help' for details",
                message
            ),
            WhisperdError::Store { message } => format!(
                "Task store error: {}\nHint: check the database path and that no other process holds the lock",
                message
            ),
            WhisperdError::Engine { engine, message } => format!(
                "Engine error ({}): {}\nHint: check that the inference runtime is reachable",
                engine, message
            ),
            WhisperdError::PoolExhausted => format!(
                "{}\nHint: raise pool.max_size or lower processor.max_concurrent_tasks",
                self
            ),
            WhisperdError::MediaFetch { message } => format!(
                "Media fetch error: {}\nHint: verify the URL and network connection",
                message
            ),
            WhisperdError::InvalidSubmission { message } => {
                format!("Invalid submission: {}", message)
            }
            WhisperdError::FileNotFound(path) => format!("File not found: {}", path),
            WhisperdError::InvalidFileName(name) => format!("Invalid file name: {}", name),
            WhisperdError::FileOperationFailed(msg) => format!("File operation failed: {}", msg),
            WhisperdError::CommandExecution(msg) => msg.clone(),
            WhisperdError::Other(err) => {
                format!("Unknown error: {}\nHint: please report this issue", err)
            }
            _ => format!("Error: {}", self),
        }
    }
}
