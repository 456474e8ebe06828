//! Error taxonomy shared by every crate in the workspace.
//!
//! Each variant maps to one failure class the pipeline distinguishes:
//! transient network conditions retry on the next tick, protocol errors
//! skip the single offending item, validation errors surface to the user
//! through a templated reply, and the webhook variants carry their HTTP
//! status with them (400 for an unknown text id, 403 for a bad signature).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Temporary network or upstream failure. The current item stays
    /// unprocessed and is retried on a later tick.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The cached portal session is no longer authenticated.
    #[error("portal session expired")]
    SessionExpired,

    /// The portal returned HTML or an AJAX payload we could not make
    /// sense of. Logged and skipped per item.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// User-supplied input failed validation (command interpreter).
    #[error("validation error: {0}")]
    Validation(String),

    /// The SMS gateway quota is at or below the configured floor.
    #[error("sms quota exhausted ({0} remaining)")]
    QuotaExhausted(i64),

    /// The SMS gateway refused the send.
    #[error("gateway rejected send: {0}")]
    GatewayReject(String),

    /// Webhook referenced a text id with no matching outbound SMS.
    #[error("no outbound sms for text id {0}")]
    UnknownTextId(String),

    /// Webhook token missing, malformed, tampered with, or expired.
    #[error("invalid or expired webhook token")]
    InvalidSignature,

    /// A named lock is held by another worker.
    #[error("lock {0} already held")]
    LockHeld(String),

    /// Unknown template key or unresolved placeholder.
    #[error("template error: {0}")]
    Template(String),

    /// IMAP command failed.
    #[error("imap error: {0}")]
    Imap(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the condition is expected to clear on its own; callers use
    /// this to decide between "retry next tick" and "skip the item".
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transient(_) | Error::SessionExpired | Error::Http(_) | Error::LockHeld(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transient("timeout".into()).is_transient());
        assert!(Error::SessionExpired.is_transient());
        assert!(Error::LockHeld("bot_lock_1".into()).is_transient());
        assert!(!Error::Validation("bad phone".into()).is_transient());
        assert!(!Error::InvalidSignature.is_transient());
    }

    #[test]
    fn test_display_messages() {
        assert_eq!(
            Error::UnknownTextId("ghost".into()).to_string(),
            "no outbound sms for text id ghost"
        );
        assert_eq!(
            Error::QuotaExhausted(0).to_string(),
            "sms quota exhausted (0 remaining)"
        );
    }
}
