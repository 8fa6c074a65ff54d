//! Session-level error taxonomy (§7), mirroring the shape of
//! `services/receiver/src/session.rs`'s `SessionError`: one `thiserror` enum
//! at the module boundary, with `#[from]` conversions for the collaborators
//! a session actually talks to.

use proto::CloseCode;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("client protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    EventMap(#[from] crate::event_map::EventMapError),

    #[error(transparent)]
    Resume(#[from] crate::resume::ResumeError),

    #[error("transport write failed: {0}")]
    TransportWrite(String),

    #[error("transport closed by peer")]
    PeerClosed,
}

impl SessionError {
    /// The close code a session should report for this error, when it
    /// warrants closing at all (§7's propagation policy).
    #[must_use]
    pub fn close_code(&self) -> CloseCode {
        match self {
            SessionError::Protocol(_) => CloseCode::InvalidPayload,
            SessionError::EventMap(crate::event_map::EventMapError::AlreadySubscribed) => {
                CloseCode::AlreadySubscribed
            }
            SessionError::EventMap(crate::event_map::EventMapError::NotSubscribed) => {
                CloseCode::NotSubscribed
            }
            SessionError::Resume(_) => CloseCode::ServerError,
            SessionError::TransportWrite(_) | SessionError::PeerClosed => CloseCode::AbnormalClosure,
        }
    }
}
