use thiserror::Error;

/// Everything that can go wrong while driving a backend process.
///
/// Errors never abort the coordinator; they are converted to a
/// `(code, message)` pair and forwarded to the UI collaborator, and the
/// affected backend simply rests at `NotRunning` until the next play.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("failed to start {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("backend connection failed: {0}")]
    Connection(String),

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error("failed to end player process")]
    Shutdown,

    #[error("config exchange failed: {0}")]
    ConfigExchange(String),
}

impl PlayerError {
    /// Stable numeric code used on the `(code, message)` collaborator
    /// surface.
    pub fn code(&self) -> i32 {
        match self {
            PlayerError::Spawn { .. } => 1,
            PlayerError::Connection(_) => 2,
            PlayerError::Protocol(_) => 3,
            PlayerError::Shutdown => 4,
            PlayerError::ConfigExchange(_) => 5,
        }
    }
}
