//! Pipe channel.
//!
//! The kernel-style pipe filesystem that actually carries upcall/downcall
//! bytes is an external collaborator, treated as a bidirectional message
//! channel with open/release callbacks. This module provides the two ends
//! of that channel as an in-memory construct:
//! [`PipeChannel`] (core-facing: enqueue upcalls, track pending messages)
//! and [`PipeEndpoint`] (daemon-facing: open/release/write_downcall),
//! grounded on the teacher's half-duplex `mpsc` sender/receiver split in
//! its peer-connection message path, plus the upcall/downcall wire
//! encodings.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use gss_io::{BinaryReader, BinaryWriter, Endian, IoError};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

use crate::error::{GssAuthError, Result};
use crate::upcall::UpcallMessage;

/// Which of the two coexisting pipes this channel speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeVersion {
    /// Legacy binary, uid-only pipe, named after the mechanism (e.g. `krb5`).
    V0,
    /// Textual, mechanism-tagged pipe, always named `gssd`.
    V1,
}

impl PipeVersion {
    pub fn node_name(self, mechanism_name: &str) -> String {
        match self {
            PipeVersion::V0 => mechanism_name.to_string(),
            PipeVersion::V1 => "gssd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum LatchState {
    #[default]
    None,
    Open(PipeVersionTag),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PipeVersionTag(PipeVersion);

/// The process-wide latch selecting which pipe version is active.
///
/// Invariant: the latch is either "none" (no pipe users) or fixed at the
/// version of the first pipe opened, never mixed. `users` and `state` are
/// read together under one lock so "latch >= 0 iff users > 0" can't be
/// observed broken.
pub struct DaemonRegistry {
    inner: Mutex<(LatchState, usize)>,
    /// Notified on every transition (open, release) so parked
    /// "waiting for any daemon" callers wake promptly instead of only on
    /// their timeout.
    changed: Notify,
    /// Sticky "we already learned the daemon is down" bit, used to pick the
    /// shortened retry timeout on the next upcall.
    known_down: AtomicUsize,
}

impl Default for DaemonRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new((LatchState::None, 0)),
            changed: Notify::new(),
            known_down: AtomicUsize::new(0),
        }
    }

    /// The single process-wide registry, for production use. Tests that
    /// need isolation construct their own [`DaemonRegistry::new`] instead.
    pub fn global() -> &'static DaemonRegistry {
        static GLOBAL: OnceLock<DaemonRegistry> = OnceLock::new();
        GLOBAL.get_or_init(DaemonRegistry::new)
    }

    /// `open(version)`: called when a daemon attaches to a pipe node.
    /// Fails with `busy` (returned as `false`) if the *other* version is
    /// already latched.
    pub fn open(&self, version: PipeVersion) -> bool {
        let mut guard = self.inner.lock();
        let ok = match guard.0 {
            LatchState::None => {
                guard.0 = LatchState::Open(PipeVersionTag(version));
                guard.1 = 1;
                true
            }
            LatchState::Open(PipeVersionTag(existing)) if existing == version => {
                guard.1 += 1;
                true
            }
            LatchState::Open(_) => false,
        };
        drop(guard);
        if ok {
            self.known_down.store(0, Ordering::Relaxed);
            self.changed.notify_waiters();
        }
        ok
    }

    /// `release()`: called when a daemon detaches. The last release resets
    /// the latch to "none" and wakes anyone parked on "daemon absent".
    pub fn release(&self) {
        let mut guard = self.inner.lock();
        if guard.1 > 0 {
            guard.1 -= 1;
        }
        if guard.1 == 0 {
            guard.0 = LatchState::None;
        }
        drop(guard);
        self.changed.notify_waiters();
    }

    pub fn current_version(&self) -> Option<PipeVersion> {
        match self.inner.lock().0 {
            LatchState::None => None,
            LatchState::Open(PipeVersionTag(v)) => Some(v),
        }
    }

    pub fn mark_known_down(&self) {
        self.known_down.store(1, Ordering::Relaxed);
    }

    pub fn is_known_down(&self) -> bool {
        self.current_version().is_none() && self.known_down.load(Ordering::Relaxed) != 0
    }

    /// Waits for any transition (open or release), or `timeout` to elapse.
    pub async fn wait_for_change(&self, timeout: std::time::Duration) {
        let _ = tokio::time::timeout(timeout, self.changed.notified()).await;
    }
}

/// The core-facing side of a pipe: upcall enqueue plus the pending set the
/// upcall coordinator consults. One instance per (Authenticator, version).
pub struct PipeChannel {
    pub version: PipeVersion,
    pub mechanism_name: String,
    registry: Arc<DaemonRegistry>,
    /// Pending upcalls keyed by uid: at most one per (pipe, uid). A
    /// `dashmap` gives per-key locking, matching the teacher's
    /// concurrent-peer-map pattern.
    pub(crate) pending: DashMap<u32, Arc<UpcallMessage>>,
    /// Outgoing upcall bytes, read by the (simulated) daemon side.
    upcall_tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// The daemon-facing side of the same channel.
pub struct PipeEndpoint {
    pub version: PipeVersion,
    registry: Arc<DaemonRegistry>,
    upcall_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    opened: bool,
}

/// Constructs a connected [`PipeChannel`]/[`PipeEndpoint`] pair, the two
/// ends of one in-memory pipe.
pub fn channel_pair(
    version: PipeVersion,
    mechanism_name: impl Into<String>,
    registry: Arc<DaemonRegistry>,
) -> (PipeChannel, PipeEndpoint) {
    let (tx, rx) = mpsc::unbounded_channel();
    let channel = PipeChannel {
        version,
        mechanism_name: mechanism_name.into(),
        registry: registry.clone(),
        pending: DashMap::new(),
        upcall_tx: tx,
    };
    let endpoint = PipeEndpoint {
        version,
        registry,
        upcall_rx: rx,
        opened: false,
    };
    (channel, endpoint)
}

impl PipeChannel {
    /// Whether a daemon is currently attached to this pipe's version.
    pub fn daemon_present(&self) -> bool {
        self.registry.current_version() == Some(self.version)
    }

    /// Sends the encoded upcall request to the (simulated) daemon. Returns
    /// `DaemonBusy` if the channel's endpoint has already been dropped,
    /// mirroring a send failure on a closed pipe.
    pub fn send_upcall(&self, bytes: Vec<u8>) -> Result<()> {
        self.upcall_tx
            .send(bytes)
            .map_err(|_| GssAuthError::DaemonBusy)
    }

    /// Fails every pending message on this pipe with `EPIPE` and clears the
    /// pending set
    pub fn fail_all_pending(&self) {
        let keys: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for uid in keys {
            if let Some((_, msg)) = self.pending.remove(&uid) {
                msg.complete_with_error(GssAuthError::PipeClosed);
            }
        }
    }
}

/// Callbacks the host pipe filesystem invokes on the core. Implemented by
/// the upcall coordinator.
#[async_trait::async_trait]
pub trait PipeChannelCallbacks: Send + Sync {
    async fn downcall(&self, pipe: &PipeChannel, bytes: &[u8]) -> Result<()>;
    fn destroy_msg(&self, msg: &Arc<UpcallMessage>);
}

impl PipeEndpoint {
    /// `open(version)`: invoked when a daemon attaches. Returns `false`
    /// ("busy") if the other pipe version is already latched.
    pub fn open_daemon(&mut self) -> bool {
        if self.opened {
            return true;
        }
        let ok = self.registry.open(self.version);
        self.opened = ok;
        if ok {
            debug!(version = ?self.version, "daemon attached to pipe");
        } else {
            warn!(version = ?self.version, "pipe open refused: other version already latched");
        }
        ok
    }

    /// `release()`: invoked when the daemon detaches.
    pub fn release_daemon(&mut self, channel: &PipeChannel) {
        if self.opened {
            channel.fail_all_pending();
            self.registry.release();
            self.opened = false;
            debug!(version = ?self.version, "daemon detached from pipe");
        }
    }

    /// Reads the next outgoing upcall, as the daemon would via `read()` on
    /// the real pipe.
    pub async fn recv_upcall(&mut self) -> Option<Vec<u8>> {
        self.upcall_rx.recv().await
    }

    /// `downcall(bytes)`: the daemon writes its reply, which the host
    /// pipe filesystem forwards into the core via the coordinator callback.
    pub async fn write_downcall(
        &self,
        channel: &PipeChannel,
        callbacks: &dyn PipeChannelCallbacks,
        bytes: &[u8],
    ) -> Result<()> {
        callbacks.downcall(channel, bytes).await
    }
}

/// Encodes a v0 (legacy binary) upcall: a 4-byte host-order uid.
pub fn encode_upcall_v0(uid: u32) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_u32(uid, Endian::Host);
    w.into_bytes()
}

/// Parameters for a v1 textual upcall line.
pub struct UpcallRequest<'a> {
    pub mechanism: &'a str,
    pub uid: u32,
    pub target: Option<&'a str>,
    pub service: Option<&'a str>,
    pub enctypes: Option<&'a str>,
}

/// Encodes a v1 upcall as `mech=<name> uid=<n> [target=...] [service=...]
/// [enctypes=...]\n`§6. Bounded by `max_bytes`.
pub fn encode_upcall_v1(req: &UpcallRequest<'_>, max_bytes: usize) -> Result<Vec<u8>> {
    let mut line = format!("mech={} uid={}", req.mechanism, req.uid);
    if let Some(target) = req.target {
        line.push_str(&format!(" target={}", target));
    }
    if let Some(service) = req.service {
        line.push_str(&format!(" service={}", service));
    }
    if let Some(enctypes) = req.enctypes {
        line.push_str(&format!(" enctypes={}", enctypes));
    }
    if line.len() + 1 > max_bytes {
        return Err(GssAuthError::Decode(IoError::length_overrun(
            line.len() + 1,
            max_bytes,
            "upcall line",
        )));
    }
    let mut w = BinaryWriter::new();
    w.write_line(&line);
    Ok(w.into_bytes())
}

/// Parses a v1 upcall line back into its fields, used by the daemon-side
/// test harness and by documentation of the encoding's round-trip.
pub fn decode_upcall_v1(bytes: &[u8], max_bytes: usize) -> Result<(u32, String)> {
    let mut r = BinaryReader::new(bytes.to_vec());
    let line = r.read_line(max_bytes)?;
    let mut uid = None;
    let mut mech = None;
    for field in line.split_whitespace() {
        if let Some(v) = field.strip_prefix("uid=") {
            uid = v.parse::<u32>().ok();
        } else if let Some(v) = field.strip_prefix("mech=") {
            mech = Some(v.to_string());
        }
    }
    let uid = uid.ok_or_else(|| {
        GssAuthError::Decode(IoError::MalformedUpcallLine {
            reason: "missing uid=".into(),
        })
    })?;
    let mech = mech.ok_or_else(|| {
        GssAuthError::Decode(IoError::MalformedUpcallLine {
            reason: "missing mech=".into(),
        })
    })?;
    Ok((uid, mech))
}

/// The parsed shape of a downcall message§6:
/// `<uid><timeout><window>` then either an errno (window == 0) or a
/// wire context netobj plus a security blob.
#[derive(Debug, Clone)]
pub struct Downcall {
    pub uid: u32,
    pub timeout_secs: u32,
    pub window: u32,
    pub outcome: DowncallOutcome,
}

#[derive(Debug, Clone)]
pub enum DowncallOutcome {
    Error(i32),
    Success { wire_ctx: Vec<u8>, sec_blob: Vec<u8> },
}

/// Reads just the leading `uid` field of a downcall message, without
/// parsing (or bounds-validating) the rest of the payload.
///
/// The upcall coordinator needs the uid *before* it knows whether the rest
/// of the message will parse cleanly, so that a malformed tail (e.g. a
/// `seclen` that overruns the buffer) can still complete the right pending
/// message with a retryable error instead of leaving it stuck forever: a
/// downcall whose parsed seclen would overrun the buffer still completes
/// with EAGAIN.
pub fn peek_downcall_uid(bytes: &[u8]) -> Result<u32> {
    let mut r = BinaryReader::new(bytes.to_vec());
    r.read_u32(Endian::Host).map_err(GssAuthError::Decode)
}

/// Decodes a downcall message (both v0 and v1 share this binary layout;
/// only the upcall encoding differs between the two pipes). Bounds are
/// enforced against `max_bytes`.
pub fn decode_downcall(bytes: &[u8], max_bytes: usize) -> Result<Downcall> {
    if bytes.len() > max_bytes {
        return Err(GssAuthError::Decode(IoError::length_overrun(
            bytes.len(),
            max_bytes,
            "downcall",
        )));
    }
    let mut r = BinaryReader::new(bytes.to_vec());
    let uid = r.read_u32(Endian::Host)?;
    let timeout_secs = r.read_u32(Endian::Host)?;
    let window = r.read_u32(Endian::Host)?;
    let outcome = if window == 0 {
        let errno = r.read_i32(Endian::Host)?;
        DowncallOutcome::Error(errno)
    } else {
        let wire_ctx = r.read_netobj(Endian::Host, max_bytes, "wire_ctx")?;
        let sec_blob = r.read_netobj(Endian::Host, max_bytes, "sec_blob")?;
        DowncallOutcome::Success { wire_ctx, sec_blob }
    };
    Ok(Downcall {
        uid,
        timeout_secs,
        window,
        outcome,
    })
}

/// Encodes a downcall, used by this crate's own test daemon harness to
/// produce replies symmetric with [`decode_downcall`].
pub fn encode_downcall(d: &Downcall) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_u32(d.uid, Endian::Host);
    w.write_u32(d.timeout_secs, Endian::Host);
    w.write_u32(d.window, Endian::Host);
    match &d.outcome {
        DowncallOutcome::Error(errno) => {
            w.write_i32(*errno, Endian::Host);
        }
        DowncallOutcome::Success { wire_ctx, sec_blob } => {
            w.write_netobj(wire_ctx, Endian::Host);
            w.write_netobj(sec_blob, Endian::Host);
        }
    }
    w.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_latch_rejects_mismatched_open() {
        let reg = DaemonRegistry::new();
        assert!(reg.open(PipeVersion::V0));
        assert!(!reg.open(PipeVersion::V1));
        assert!(reg.open(PipeVersion::V0));
    }

    #[test]
    fn version_latch_resets_on_last_release() {
        let reg = DaemonRegistry::new();
        assert!(reg.open(PipeVersion::V1));
        assert!(reg.open(PipeVersion::V1));
        reg.release();
        assert_eq!(reg.current_version(), Some(PipeVersion::V1));
        reg.release();
        assert_eq!(reg.current_version(), None);
        assert!(reg.open(PipeVersion::V0));
    }

    #[test]
    fn upcall_v1_round_trips() {
        let req = UpcallRequest {
            mechanism: "krb5",
            uid: 1000,
            target: None,
            service: None,
            enctypes: None,
        };
        let bytes = encode_upcall_v1(&req, 128).unwrap();
        let (uid, mech) = decode_upcall_v1(&bytes, 128).unwrap();
        assert_eq!(uid, 1000);
        assert_eq!(mech, "krb5");
    }

    #[test]
    fn downcall_round_trips_success() {
        let d = Downcall {
            uid: 1000,
            timeout_secs: 3600,
            window: 128,
            outcome: DowncallOutcome::Success {
                wire_ctx: b"AA".to_vec(),
                sec_blob: vec![1, 2, 3],
            },
        };
        let bytes = encode_downcall(&d);
        let back = decode_downcall(&bytes, 1024).unwrap();
        assert_eq!(back.uid, 1000);
        assert_eq!(back.window, 128);
        match back.outcome {
            DowncallOutcome::Success { wire_ctx, sec_blob } => {
                assert_eq!(wire_ctx, b"AA");
                assert_eq!(sec_blob, vec![1, 2, 3]);
            }
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn downcall_error_path_has_no_context() {
        let d = Downcall {
            uid: 1000,
            timeout_secs: 0,
            window: 0,
            outcome: DowncallOutcome::Error(-127),
        };
        let bytes = encode_downcall(&d);
        let back = decode_downcall(&bytes, 1024).unwrap();
        assert!(matches!(back.outcome, DowncallOutcome::Error(-127)));
    }

    #[test]
    fn decode_downcall_overrun_is_an_error() {
        let oversized = vec![0u8; 2048];
        let err = decode_downcall(&oversized, 1024).unwrap_err();
        assert!(matches!(err, GssAuthError::Decode(_)));
    }
}
