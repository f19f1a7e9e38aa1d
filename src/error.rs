use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Sandbox is not ready yet")]
    SandboxNotReady,

    #[error("Failed to spawn process: {0}")]
    ProcessSpawn(String),

    #[error("Output stream failed: {0}")]
    StreamRead(String),

    #[error("Failed to write {path}: {message}")]
    BootstrapFile { path: String, message: String },

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Session not found for ID: {0}")]
    SessionNotFound(String),

    #[error("Session {0} still has a running dev server")]
    SessionInUse(String),
}

impl AppError {
    /// Text shown in a session's output when this error ends a command.
    pub fn to_terminal_line(&self) -> String {
        match self {
            AppError::SandboxNotReady => {
                "Sandbox is not ready yet. Wait for it to finish booting and retry.".to_string()
            }
            AppError::CommandBlocked(cmd) => format!("Command blocked by policy: {}", cmd),
            other => other.to_string(),
        }
    }
}
