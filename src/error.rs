//! Error types for the playground core

/// Result type alias for playground operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the controller, the gateway and the live channel.
///
/// Decode problems with widget configuration never show up here; the codec
/// degrades them to `None` instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure (connection refused, DNS, reset)
    #[error("network error: {0}")]
    Network(String),

    /// Request exceeded the configured timeout
    #[error("timeout: {0}")]
    Timeout(String),

    /// Service answered with a non-success status
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Missing or rejected session token
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Response body did not match the expected shape
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Live channel failure
    #[error("socket error: {0}")]
    Socket(String),

    /// Invalid client configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Widget needs a bound pin and none was selected
    #[error("widget {instance_id} requires a virtual pin")]
    MissingPin { instance_id: String },

    /// Every placed widget was rejected during export
    #[error("nothing to save: {skipped} widget(s) skipped, none exportable")]
    NothingToSave { skipped: usize },

    /// The instance is already bound to another pin and must be reset first
    #[error("widget {instance_id} is bound to pin {bound}; reset it before choosing another")]
    PinLocked { instance_id: String, bound: String },

    /// The pin is held by another widget
    #[error("virtual pin {pin} is already in use")]
    PinInUse { pin: String },

    /// Catalog has no widget with this id
    #[error("unknown widget: {0}")]
    UnknownWidget(String),

    /// Instance is no longer part of the scene
    #[error("widget instance not found: {0}")]
    InstanceNotFound(String),
}

impl Error {
    /// Whether this error was raised before any network call was made
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingPin { .. }
                | Error::NothingToSave { .. }
                | Error::PinLocked { .. }
                | Error::PinInUse { .. }
                | Error::UnknownWidget(_)
                | Error::InstanceNotFound(_)
                | Error::Config(_)
        )
    }

    /// Whether retrying the same call could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) | Error::Socket(_) => true,
            Error::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout("request timed out".to_string())
        } else if err.is_decode() {
            Error::Serialization(err.to_string())
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                401 | 403 => Error::Unauthorized(err.to_string()),
                code => Error::Server {
                    status: code,
                    message: err.to_string(),
                },
            }
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Socket(err.to_string())
    }
}
