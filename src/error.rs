use crate::session::SessionState;

/// Stable error codes surfaced to clients, both as synchronous statuses and
/// inside terminal [`crate::events::TranscodeEvent::Error`] notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidSource,
    InvalidDestination,
    InvalidTrackIndex,
    InvalidTrackFormat,
    UnsupportedMime,
    InvalidState,
    StartFailure,
    SourceFailure,
    DecodeFailure,
    EncodeFailure,
    MuxFailure,
    ResumeRejected,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TranscodeError {
    #[error("source cannot be opened or demuxed: {0}")]
    InvalidSource(String),

    #[error("destination is not writable: {0}")]
    InvalidDestination(String),

    #[error("no track with index {0}")]
    InvalidTrackIndex(usize),

    #[error("track format is missing mandatory field {0:?}")]
    InvalidTrackFormat(&'static str),

    #[error("no codec available for mime type {0:?}")]
    UnsupportedMime(String),

    #[error("operation not allowed in state {0:?}")]
    InvalidState(SessionState),

    #[error("cannot start: {0}")]
    StartFailure(String),

    #[error("demux failure on track {track}: {message}")]
    SourceFailure { track: usize, message: String },

    #[error("decode failure on track {track}: {message}")]
    DecodeFailure { track: usize, message: String },

    #[error("encode failure on track {track}: {message}")]
    EncodeFailure { track: usize, message: String },

    #[error("mux failure: {0}")]
    MuxFailure(String),

    #[error("pause token rejected: {0}")]
    ResumeRejected(String),

    #[error("no resume request within the grace window")]
    Timeout,

    #[error("session cancelled")]
    Cancelled,

    #[error("session actor is gone")]
    Closed,
}

impl TranscodeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TranscodeError::InvalidSource(_) => ErrorCode::InvalidSource,
            TranscodeError::InvalidDestination(_) => ErrorCode::InvalidDestination,
            TranscodeError::InvalidTrackIndex(_) => ErrorCode::InvalidTrackIndex,
            TranscodeError::InvalidTrackFormat(_) => ErrorCode::InvalidTrackFormat,
            TranscodeError::UnsupportedMime(_) => ErrorCode::UnsupportedMime,
            TranscodeError::InvalidState(_) => ErrorCode::InvalidState,
            TranscodeError::StartFailure(_) => ErrorCode::StartFailure,
            TranscodeError::SourceFailure { .. } => ErrorCode::SourceFailure,
            TranscodeError::DecodeFailure { .. } => ErrorCode::DecodeFailure,
            TranscodeError::EncodeFailure { .. } => ErrorCode::EncodeFailure,
            TranscodeError::MuxFailure(_) => ErrorCode::MuxFailure,
            TranscodeError::ResumeRejected(_) => ErrorCode::ResumeRejected,
            TranscodeError::Timeout => ErrorCode::Timeout,
            TranscodeError::Cancelled => ErrorCode::Cancelled,
            // Actor teardown only happens after cancel or a terminal state.
            TranscodeError::Closed => ErrorCode::InvalidState,
        }
    }
}

pub type Result<T> = std::result::Result<T, TranscodeError>;
