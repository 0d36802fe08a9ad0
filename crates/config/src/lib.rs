//! Configuration for the RPCSEC_GSS client runtime.
//!
//! Every client tunable (and the few a production client needs around
//! daemon-wait timeouts) lives here as a named, documented constant plus a
//! `serde`-derived config struct, rather than scattered magic numbers
//! through the upcall/credential/authenticator modules.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cooling-off window after a daemon reports a key as expired.
pub const DEFAULT_EXPIRED_CRED_RETRY_DELAY_SECS: u64 = 5;

/// Default time a synchronous caller waits for any daemon to attach to a
/// pipe before giving up.
pub const DEFAULT_DAEMON_WAIT_TIMEOUT_SECS: u64 = 15;

/// Shortened wait once the daemon is already known to be down, so repeated
/// calls fail fast instead of re-paying the full timeout.
pub const DEFAULT_DAEMON_DOWN_RETRY_TIMEOUT_MS: u64 = 250;

/// Maximum length of a v1 upcall line.
pub const DEFAULT_UPCALL_LINE_MAX_BYTES: usize = 128;

/// Maximum size of a downcall message.
pub const DEFAULT_DOWNCALL_MAX_BYTES: usize = 1024;

/// Minimum context lifetime applied when the daemon reports `timeout == 0`:
/// a reported timeout of zero means "use a minimum of one hour".
pub const MINIMUM_CONTEXT_TIMEOUT_SECS: u64 = 3600;

/// Runtime configuration for the RPCSEC_GSS client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GssConfig {
    /// How long a `NEGATIVE` credential refuses to re-upcall after the
    /// daemon reported an expired key.
    #[serde(with = "duration_secs")]
    pub expired_cred_retry_delay: Duration,

    /// How long a synchronous caller waits for a daemon to open the pipe
    /// before surfacing `EACCES`.
    #[serde(with = "duration_secs")]
    pub daemon_wait_timeout: Duration,

    /// Shortened wait used once "daemon is down" has already been learned.
    #[serde(with = "duration_millis")]
    pub daemon_down_retry_timeout: Duration,

    /// Maximum accepted length of a v1 upcall line.
    pub upcall_line_max_bytes: usize,

    /// Maximum accepted size of a downcall message.
    pub downcall_max_bytes: usize,
}

impl Default for GssConfig {
    fn default() -> Self {
        Self {
            expired_cred_retry_delay: Duration::from_secs(DEFAULT_EXPIRED_CRED_RETRY_DELAY_SECS),
            daemon_wait_timeout: Duration::from_secs(DEFAULT_DAEMON_WAIT_TIMEOUT_SECS),
            daemon_down_retry_timeout: Duration::from_millis(
                DEFAULT_DAEMON_DOWN_RETRY_TIMEOUT_MS,
            ),
            upcall_line_max_bytes: DEFAULT_UPCALL_LINE_MAX_BYTES,
            downcall_max_bytes: DEFAULT_DOWNCALL_MAX_BYTES,
        }
    }
}

impl GssConfig {
    /// The context lifetime to install for a daemon-reported `timeout`,
    /// applying the "0 means one hour" floor.
    pub fn normalize_context_timeout(&self, daemon_timeout_secs: u32) -> Duration {
        if daemon_timeout_secs == 0 {
            Duration::from_secs(MINIMUM_CONTEXT_TIMEOUT_SECS)
        } else {
            Duration::from_secs(daemon_timeout_secs as u64)
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
