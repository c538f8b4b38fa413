use thiserror::Error;

/// Coarse classification callers branch on instead of parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Validation,
    NotFound,
    Unauthorized,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum FlowChatError {
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Http {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not signed in")]
    Unauthenticated,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlowChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowChatError::Transport { .. } => ErrorKind::Network,
            FlowChatError::Http { status, .. } => match *status {
                400 | 422 => ErrorKind::Validation,
                401 | 403 => ErrorKind::Unauthorized,
                404 => ErrorKind::NotFound,
                _ => ErrorKind::Unknown,
            },
            FlowChatError::Validation(_) => ErrorKind::Validation,
            FlowChatError::Unauthenticated => ErrorKind::Unauthorized,
            FlowChatError::Decode { .. }
            | FlowChatError::Config(_)
            | FlowChatError::Io(_)
            | FlowChatError::Json(_)
            | FlowChatError::Internal(_) => ErrorKind::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowChatError>;
