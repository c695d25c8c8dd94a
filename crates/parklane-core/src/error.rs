//! Error types for every core subsystem.
//!
//! One enum per subsystem. Recoverable outcomes (duplicate uplink, orphan
//! device, spooled envelope) are modeled as return values where they occur,
//! not as error variants — these enums cover genuine failures only.

/// Errors from webhook signature verification.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    /// A required signature header is missing.
    #[error("missing header: {0}")]
    MissingHeader(&'static str),

    /// The timestamp header is not a unix-seconds integer.
    #[error("malformed timestamp: {0}")]
    MalformedTimestamp(String),

    /// The signature header is not valid hex.
    #[error("malformed signature encoding")]
    MalformedSignature,

    /// The timestamp is outside the allowed replay window.
    #[error("timestamp outside replay window ({skew_secs}s skew, {window_secs}s allowed)")]
    SkewExceeded { skew_secs: i64, window_secs: i64 },

    /// The HMAC did not match.
    #[error("signature mismatch")]
    Mismatch,
}

/// Errors from uplink payload decoding.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The payload is shorter than the device type requires.
    #[error("payload truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    /// The port is not one this device type transmits on.
    #[error("unexpected port {port} for device type {kind}")]
    UnexpectedPort { kind: String, port: u16 },
}

/// Errors from EUI parsing.
#[derive(Debug, thiserror::Error)]
#[error("invalid EUI {input:?}: {reason}")]
pub struct EuiParseError {
    pub input: String,
    pub reason: &'static str,
}

/// Errors from the principal / credential subsystem.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Credentials missing or unverifiable.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Credential valid but lacks the required scope or role.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The access token has expired.
    #[error("access token expired")]
    TokenExpired,

    /// Password hashing or verification failed internally.
    #[error("credential hashing failed: {0}")]
    Hashing(String),

    /// Token signing or parsing failed internally.
    #[error("token codec failed: {0}")]
    TokenCodec(String),
}

/// Errors from the on-disk spool.
#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    /// Filesystem operation failed.
    #[error("spool io at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// An envelope file could not be decoded.
    #[error("corrupt spool envelope at {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Errors from display policy parsing.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A color is not a 6-digit hex RGB string.
    #[error("invalid color {0:?}: expected 6 hex digits")]
    InvalidColor(String),
}
