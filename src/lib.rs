pub mod audio_capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod playback;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transcript;
pub mod transport;

pub use error::{Result, SessionError};
pub use session::{Session, SessionEvent, SessionHandle, SessionState, SpeakerState};
