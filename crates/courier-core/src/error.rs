//! Errors surfaced to clients as `message_error`.

use crate::router::RouterError;
use crate::store::StoreError;
use courier_protocol::{codes, ServerEvent};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a client request.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed payload.
    #[error("{0}")]
    Validation(String),

    /// The resource does not exist or the caller does not own it. Both cases
    /// produce the same error.
    #[error("{0} not found or access denied")]
    NotFoundOrForbidden(&'static str),

    #[error("{0}")]
    Forbidden(String),

    #[error("not authenticated")]
    Unauthenticated,

    /// Storage failure. The message is generic; the cause is logged where it
    /// happened.
    #[error("failed to {0}")]
    Persistence(&'static str),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Code carried by the `message_error` event.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Error::Validation(_) => codes::VALIDATION,
            Error::NotFoundOrForbidden(_) => codes::NOT_FOUND,
            Error::Forbidden(_) => codes::FORBIDDEN,
            Error::Unauthenticated => codes::UNAUTHENTICATED,
            Error::Router(RouterError::InvalidRoom(_)) => codes::VALIDATION,
            Error::Router(_) => codes::FORBIDDEN,
            Error::Persistence(_) | Error::Store(_) => codes::INTERNAL,
        }
    }

    /// Convert into the event sent back to the acting connection.
    #[must_use]
    pub fn to_event(&self) -> ServerEvent {
        let message = match self {
            Error::Store(_) => "storage unavailable".to_string(),
            other => other.to_string(),
        };
        ServerEvent::error(self.code(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(Error::Validation("x".into()).code(), 4000);
        assert_eq!(Error::Unauthenticated.code(), 4001);
        assert_eq!(Error::Forbidden("x".into()).code(), 4003);
        assert_eq!(Error::NotFoundOrForbidden("Message").code(), 4004);
        assert_eq!(Error::Persistence("send message").code(), 5000);
        assert_eq!(Error::Router(RouterError::MaxRoomsReached).code(), 4003);
    }

    #[test]
    fn test_event_text() {
        let event = Error::NotFoundOrForbidden("Message").to_event();
        assert_eq!(
            event,
            ServerEvent::error(4004, "Message not found or access denied")
        );

        let event = Error::Persistence("send message").to_event();
        assert_eq!(event, ServerEvent::error(5000, "failed to send message"));

        let event = Error::Store(StoreError::Unavailable("db locked at /var/x".into())).to_event();
        assert_eq!(event, ServerEvent::error(5000, "storage unavailable"));
    }
}
