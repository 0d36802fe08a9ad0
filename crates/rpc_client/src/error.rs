//! Error taxonomy for the RPCSEC_GSS client.
//!
//! One variant per failure mode a caller of the original kernel client could
//! observe, each carrying the POSIX errno it would have seen, exposed
//! through [`GssAuthError::errno`] so boundary behaviour stays testable
//! against concrete numbers without leaking raw integers through the rest
//! of the API. The same shape as the teacher's `RpcError::is_retryable`
//! helper-method pattern.

use thiserror::Error;

/// POSIX errno surfaced when the daemon actively refused the request.
pub const EACCES: i32 = 13;
/// POSIX errno surfaced when the pipe had no daemon attached and retrying
/// would not help without operator intervention (after the wait timeout).
pub const EAGAIN: i32 = 11;
/// POSIX errno for "wrong file descriptor state", reused here for pipe
/// teardown mid-upcall
pub const EPIPE: i32 = 32;
/// Linux's `EKEYEXPIRED`, surfaced verbatim when the daemon reports it.
pub const EKEYEXPIRED: i32 = 127;
/// Surfaced when a synchronous waiter is killed while parked.
pub const ERESTARTSYS: i32 = 512;
/// A provider (MIC/wrap/unwrap) or verifier-structure failure that is not
/// context expiry; the call fails outright with an IO error.
pub const EIO: i32 = 5;

/// Errors this crate can raise, carrying the errno a caller of the original
/// kernel client would have seen.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GssAuthError {
    /// Daemon absent, or a non-sleeping allocation failed on the send path.
    #[error("daemon unavailable, retry after wait")]
    DaemonBusy,

    /// Daemon explicitly refused the request, or the daemon-absence wait
    /// timed out.
    #[error("daemon refused the request")]
    AccessDenied,

    /// Daemon reported the security context's key (e.g. Kerberos TGT) has
    /// expired; the credential is in its `NEGATIVE` cooling-off window.
    #[error("security context key has expired")]
    KeyExpired,

    /// The pipe's daemon detached while this request was pending.
    #[error("pipe closed while upcall was pending")]
    PipeClosed,

    /// A synchronous waiter was killed while parked on the upcall.
    #[error("waiter was killed before the upcall completed")]
    Restart,

    /// The mechanism provider rejected a MIC/wrap/unwrap operation for a
    /// reason other than context expiry.
    #[error("security provider rejected the operation: {0}")]
    MechanismFailure(#[from] super::mechanism::MechError),

    /// A reply's auth verifier failed RPCSEC_GSS-level structural checks
    /// (wrong flavor, oversized length) before the MIC was even checked.
    #[error("invalid RPCSEC_GSS verifier: {0}")]
    InvalidVerifier(String),

    /// A wire-level decode failure (bounds violation, malformed line) that
    /// collapses to a retry rather than poisoning the credential.
    #[error("wire decode error, treated as retryable: {0}")]
    Decode(#[from] gss_io::IoError),
}

impl GssAuthError {
    /// The POSIX-style errno a caller of the original kernel client would
    /// have observed for this error.
    pub fn errno(&self) -> i32 {
        match self {
            GssAuthError::DaemonBusy => EAGAIN,
            GssAuthError::AccessDenied => EACCES,
            GssAuthError::KeyExpired => EKEYEXPIRED,
            GssAuthError::PipeClosed => EPIPE,
            GssAuthError::Restart => ERESTARTSYS,
            // Bounds violations and import failures collapse to EAGAIN.
            GssAuthError::Decode(_) => EAGAIN,
            // A provider rejection that isn't context-expiry, or a
            // structurally invalid verifier, fails the call with an IO error.
            GssAuthError::MechanismFailure(_) => EIO,
            GssAuthError::InvalidVerifier(_) => EIO,
        }
    }

    /// Whether a caller should expect a subsequent retry to be driven
    /// automatically (by the upcall coordinator or RPC scheduler) rather
    /// than surfacing as a terminal failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GssAuthError::DaemonBusy | GssAuthError::Decode(_))
    }
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, GssAuthError>;
