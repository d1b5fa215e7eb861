use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::session::SessionState;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Audio device unavailable: {0}")]
    DeviceAcquisition(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cannot start session while {0}")]
    InvalidState(SessionState),
}

impl SessionError {
    /// Device and transport failures end the session; everything else is
    /// recovered where it happened.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::DeviceAcquisition(_) | SessionError::Transport(_)
        )
    }
}

impl From<ConfigError> for SessionError {
    fn from(err: ConfigError) -> Self {
        SessionError::Config(err.to_string())
    }
}

impl From<crate::transport::TransportError> for SessionError {
    fn from(err: crate::transport::TransportError) -> Self {
        SessionError::Transport(err.to_string())
    }
}

impl From<crate::audio_capture::AudioError> for SessionError {
    fn from(err: crate::audio_capture::AudioError) -> Self {
        SessionError::DeviceAcquisition(err.to_string())
    }
}
