//! Crate-wide error type.
//!
//! One `thiserror` enum per error category in the taxonomy, each carrying a
//! stable numeric code band so a JS host can branch on `.code()` without
//! string-matching a message. See `SPEC_FULL.md` §7.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// All errors surfaced by the core.
///
/// Category code bands: 100s Configuration, 200s Transport, 300s Signaling,
/// 400s Channel, 500s Media, 600s Verification, 700s Storage.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid display name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("malformed bus URL {url:?}")]
    MalformedBusUrl { url: String },

    #[error("malformed ICE server entry: {reason}")]
    MalformedIceServer { reason: String },

    #[error("bus transport error: {0}")]
    Transport(String),

    #[error("bus disconnected")]
    Disconnected,

    #[error("signaling protocol error: {0}")]
    Signaling(String),

    #[error("no peer connection for {peer}")]
    UnknownPeer { peer: String },

    #[error("channel {channel:?} is closed")]
    ChannelClosed { channel: String },

    #[error("timed out waiting for channel {channel:?} to open")]
    ChannelOpenTimeout { channel: String },

    #[error("media error: {0}")]
    Media(String),

    #[error("getUserMedia was denied or failed: {0}")]
    MediaCaptureFailed(String),

    #[error("signature verification failed for {peer}")]
    VerificationFailed { peer: String },

    #[error("key for {name:?} is already bound to a different public key")]
    KeyBindingConflict { name: String },

    #[error("storage backend unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage quota exceeded")]
    StorageQuotaExceeded,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable numeric code, stable across releases, suitable for a JS host
    /// to branch on instead of parsing `Display` text.
    pub fn code(&self) -> u32 {
        match self {
            Error::InvalidName { .. } => 101,
            Error::MalformedBusUrl { .. } => 102,
            Error::MalformedIceServer { .. } => 103,
            Error::Transport(_) => 201,
            Error::Disconnected => 202,
            Error::Signaling(_) => 301,
            Error::UnknownPeer { .. } => 302,
            Error::ChannelClosed { .. } => 401,
            Error::ChannelOpenTimeout { .. } => 402,
            Error::Media(_) => 501,
            Error::MediaCaptureFailed(_) => 502,
            Error::VerificationFailed { .. } => 601,
            Error::KeyBindingConflict { .. } => 602,
            Error::StorageUnavailable(_) => 701,
            Error::StorageQuotaExceeded => 702,
            Error::Other(_) => 900,
        }
    }

    /// Configuration errors are fatal to the caller; everything else is a
    /// condition the core can recover from on its own (reconnect, retry,
    /// drop-and-log) per the propagation policy in SPEC_FULL.md §7.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidName { .. } | Error::MalformedBusUrl { .. } | Error::MalformedIceServer { .. }
        )
    }

    /// Errors that should be surfaced to the application rather than
    /// silently retried (verification failures, media capture denial).
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            Error::VerificationFailed { .. }
                | Error::KeyBindingConflict { .. }
                | Error::MediaCaptureFailed(_)
        )
    }
}

/// JSON-serializable shape for crossing the wasm-bindgen boundary into JS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfiError {
    pub code: u32,
    pub message: String,
    pub recoverable: bool,
    pub requires_user_action: bool,
}

impl From<&Error> for FfiError {
    fn from(err: &Error) -> Self {
        FfiError {
            code: err.code(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            requires_user_action: err.requires_user_action(),
        }
    }
}

impl From<Error> for FfiError {
    fn from(err: Error) -> Self {
        FfiError::from(&err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Other(format!("json: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_fall_in_the_right_band() {
        assert_eq!(
            Error::InvalidName { name: "x".into(), reason: "r" }.code() / 100,
            1
        );
        assert_eq!(Error::Transport("x".into()).code() / 100, 2);
        assert_eq!(Error::Signaling("x".into()).code() / 100, 3);
        assert_eq!(
            Error::ChannelClosed { channel: "chat".into() }.code() / 100,
            4
        );
        assert_eq!(Error::Media("x".into()).code() / 100, 5);
        assert_eq!(
            Error::VerificationFailed { peer: "bob".into() }.code() / 100,
            6
        );
        assert_eq!(Error::StorageQuotaExceeded.code() / 100, 7);
    }

    #[test]
    fn configuration_errors_are_not_recoverable() {
        let e = Error::InvalidName { name: "a(b)".into(), reason: "parens" };
        assert!(!e.is_recoverable());
        assert!(Error::Disconnected.is_recoverable());
    }

    #[test]
    fn verification_and_media_errors_require_user_action() {
        assert!(Error::VerificationFailed { peer: "bob".into() }.requires_user_action());
        assert!(Error::MediaCaptureFailed("denied".into()).requires_user_action());
        assert!(!Error::Disconnected.requires_user_action());
    }

    #[test]
    fn ffi_error_round_trip() {
        let e = Error::KeyBindingConflict { name: "bob".into() };
        let ffi: FfiError = (&e).into();
        assert_eq!(ffi.code, 602);
        assert!(ffi.requires_user_action);
        let json = serde_json::to_string(&ffi).unwrap();
        let back: FfiError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, ffi.code);
    }
}
