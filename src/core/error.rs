use crate::core::coordinator::Feature;
use crate::core::gamma::DisplayId;
use crate::elevation::ElevationError;
use thiserror::Error;

/// Stage of a configuration-store transaction that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConfigStage {
    Lock,
    Read,
    Commit,
    Apply,
}

/// Core error types for hush
#[derive(Debug, Error)]
pub enum Error {
    /// The user dismissed or failed the elevation prompt
    #[error("Authorization denied")]
    AuthorizationDenied,

    /// Elevation could not be attempted at all
    #[error("Authorization unavailable: {0}")]
    AuthorizationUnavailable(String),

    /// Lock, read, commit or apply against the network configuration store failed
    #[error("Network configuration {stage} failed: {message}")]
    ConfigAccess { stage: ConfigStage, message: String },

    /// The proxy auto-config script could not be persisted
    #[error("I/O error: {0}")]
    PersistenceIo(#[from] std::io::Error),

    /// A display's transfer table could not be read
    #[error("Display {display}: query failed: {message}")]
    DisplayQuery { display: DisplayId, message: String },

    /// A display's transfer table could not be written
    #[error("Display {display}: write failed: {message}")]
    DisplayWrite { display: DisplayId, message: String },

    /// Another operation is already in flight for this feature
    #[error("{0} is already changing state")]
    Busy(Feature),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(stage: ConfigStage, message: impl Into<String>) -> Self {
        Self::ConfigAccess {
            stage,
            message: message.into(),
        }
    }

    /// Per-display failures never abort a whole grayscale operation.
    pub fn is_display_local(&self) -> bool {
        matches!(self, Self::DisplayQuery { .. } | Self::DisplayWrite { .. })
    }

    /// Returns the message and hints the presentation layer should show.
    pub fn translate(&self) -> ErrorTranslation {
        match self {
            Self::AuthorizationDenied => {
                ErrorTranslation::new("Administrator permission was not granted")
                    .with_suggestion("Changing the system proxy requires an administrator password")
                    .with_suggestion("Enable blocking again and approve the prompt")
            }
            Self::AuthorizationUnavailable(reason) => ErrorTranslation::new(format!(
                "Could not request administrator permission: {reason}"
            ))
            .with_suggestion("Set HUSH_ELEVATION_METHOD to sudo, run0, pkexec or osascript")
            .with_suggestion("Ensure the chosen tool is installed and on PATH"),
            Self::ConfigAccess {
                stage: ConfigStage::Lock,
                ..
            } => ErrorTranslation::new("Network settings are locked by another application")
                .with_suggestion("Close System Settings or any VPN/proxy tool and try again"),
            Self::ConfigAccess { stage, message } => {
                ErrorTranslation::new(format!("Could not {stage} network settings: {message}"))
                    .with_suggestion("No proxy settings were left half-applied")
                    .with_suggestion("Try again; if it keeps failing, check the audit log")
            }
            Self::PersistenceIo(e) if e.kind() == std::io::ErrorKind::StorageFull => {
                ErrorTranslation::new("Disk full: cannot save the block list script")
                    .with_suggestion("Free up space and try again")
            }
            Self::PersistenceIo(e) => {
                ErrorTranslation::new(format!("Could not save the block list script: {e}"))
                    .with_suggestion("Check permissions of the application support directory")
            }
            Self::DisplayQuery { display, .. } | Self::DisplayWrite { display, .. } => {
                ErrorTranslation::new(format!("Display {display} does not support grayscale"))
                    .with_suggestion("Other displays were still updated")
            }
            Self::Busy(feature) => {
                ErrorTranslation::new(format!("{feature} is still switching, please wait"))
            }
            Self::Serialization(e) => ErrorTranslation::new(format!("Corrupt data: {e}")),
            Self::Internal(msg) => ErrorTranslation::new(format!("Internal error: {msg}")),
        }
    }
}

impl From<ElevationError> for Error {
    fn from(err: ElevationError) -> Self {
        match err {
            ElevationError::Denied => Self::AuthorizationDenied,
            other => Self::AuthorizationUnavailable(other.to_string()),
        }
    }
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;
