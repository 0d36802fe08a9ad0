//! Upcall coordination.
//!
//! De-duplicates concurrent requests for the same uid, forwards exactly one
//! upcall per uid to the (simulated) daemon, and fans a single downcall
//! reply out to every waiter: both synchronous callers blocked on a
//! `Notify` (standing in for the kernel's `KILLABLE` waitqueue) and
//! asynchronous callbacks registered by the refresh path (standing in for
//! RPC tasks parked with a completion callback).

use std::sync::Arc;

use gss_config::GssConfig;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::credential::Context;
use crate::error::{GssAuthError, Result};
use crate::mechanism::{Mechanism, MechResult, MechanismProvider};
use crate::pipe::{
    decode_downcall, encode_upcall_v0, encode_upcall_v1, peek_downcall_uid, DaemonRegistry,
    DowncallOutcome, PipeChannel, PipeChannelCallbacks, PipeVersion, UpcallRequest,
};

/// Completion state of an in-flight upcall.
enum UpcallState {
    Pending,
    Done(std::result::Result<Arc<Context>, GssAuthError>),
}

/// A single in-flight, de-duplicated upcall for one (pipe, uid) pair.
///
/// Invariant: at most one of these exists per (pipe, uid) at a time,
/// enforced by [`UpcallCoordinator`] inserting via `dashmap`'s atomic entry
/// API rather than check-then-insert.
pub struct UpcallMessage {
    pub uid: u32,
    state: Mutex<UpcallState>,
    /// Wakes synchronous waiters parked in `wait_sync`.
    sync_waiters: Notify,
    /// Callbacks registered by the async refresh path, drained on
    /// completion.
    async_waiters: Mutex<Vec<Box<dyn FnOnce(std::result::Result<Arc<Context>, GssAuthError>) + Send>>>,
}

impl UpcallMessage {
    fn new(uid: u32) -> Arc<Self> {
        Arc::new(Self {
            uid,
            state: Mutex::new(UpcallState::Pending),
            sync_waiters: Notify::new(),
            async_waiters: Mutex::new(Vec::new()),
        })
    }

    fn is_done(&self) -> bool {
        !matches!(*self.state.lock(), UpcallState::Pending)
    }

    /// Synchronous wait path: re-checks the completion predicate under the
    /// message's own lock on each wake. `cancel` models the `KILLABLE`
    /// wait state: if it fires first, the
    /// caller observes `ERESTARTSYS` while the upcall itself keeps running
    /// in the background for the benefit of other waiters.
    pub async fn wait_sync(&self, cancel: &CancellationToken) -> Result<Arc<Context>> {
        loop {
            if let UpcallState::Done(ref result) = *self.state.lock() {
                return result.clone_result();
            }
            tokio::select! {
                _ = self.sync_waiters.notified() => continue,
                _ = cancel.cancelled() => return Err(GssAuthError::Restart),
            }
        }
    }

    /// Async path: registers `on_done` to run at fan-out time (or
    /// immediately, if the message is already complete). Used by the
    /// refresh path, which never blocks its caller.
    pub fn on_complete(
        self: &Arc<Self>,
        on_done: impl FnOnce(std::result::Result<Arc<Context>, GssAuthError>) + Send + 'static,
    ) {
        let mut state = self.state.lock();
        match &*state {
            UpcallState::Done(result) => {
                let result = result.clone_result();
                drop(state);
                on_done(result);
            }
            UpcallState::Pending => {
                self.async_waiters.lock().push(Box::new(on_done));
                drop(state);
            }
        }
    }

    fn complete(self: &Arc<Self>, result: std::result::Result<Arc<Context>, GssAuthError>) {
        {
            let mut state = self.state.lock();
            if !matches!(*state, UpcallState::Pending) {
                return;
            }
            *state = UpcallState::Done(result.clone_result());
        }
        self.sync_waiters.notify_waiters();
        for cb in self.async_waiters.lock().drain(..) {
            cb(result.clone_result());
        }
    }

    pub fn complete_with_context(self: &Arc<Self>, ctx: Arc<Context>) {
        self.complete(Ok(ctx));
    }

    pub fn complete_with_error(self: &Arc<Self>, err: GssAuthError) {
        self.complete(Err(err));
    }
}

/// `Result<Arc<Context>, GssAuthError>` is cloned out to every waiter on
/// fan-out; `GssAuthError` and `Arc<Context>` are both cheaply clonable so
/// this is just a named convenience rather than a derive.
trait CloneResult {
    fn clone_result(&self) -> std::result::Result<Arc<Context>, GssAuthError>;
}

impl CloneResult for std::result::Result<Arc<Context>, GssAuthError> {
    fn clone_result(&self) -> std::result::Result<Arc<Context>, GssAuthError> {
        self.clone()
    }
}

/// De-duplicates and drives upcalls for a set of pipes sharing one
/// [`DaemonRegistry`].
pub struct UpcallCoordinator {
    pub registry: Arc<DaemonRegistry>,
    pub mechanism: Arc<Mechanism>,
    pub provider: Arc<dyn MechanismProvider>,
    pub config: GssConfig,
}

impl UpcallCoordinator {
    pub fn new(
        registry: Arc<DaemonRegistry>,
        mechanism: Arc<Mechanism>,
        provider: Arc<dyn MechanismProvider>,
        config: GssConfig,
    ) -> Self {
        Self {
            registry,
            mechanism,
            provider,
            config,
        }
    }

    /// Inserts-or-fetches the pending [`UpcallMessage`] for `uid` on
    /// `pipe`, sending the encoded upcall exactly once. Returns the shared
    /// message and whether this call was the one that actually sent it.
    fn dedup_and_send(&self, pipe: &PipeChannel, uid: u32, principal: Option<&str>) -> Result<Arc<UpcallMessage>> {
        let mut sent = false;
        let msg = pipe
            .pending
            .entry(uid)
            .or_insert_with(|| {
                sent = true;
                UpcallMessage::new(uid)
            })
            .clone();
        if sent {
            let bytes = match pipe.version {
                PipeVersion::V0 => encode_upcall_v0(uid),
                PipeVersion::V1 => encode_upcall_v1(
                    &UpcallRequest {
                        mechanism: self.mechanism.name(),
                        uid,
                        target: principal,
                        service: None,
                        enctypes: Some(&self.mechanism.upcall_enctype),
                    },
                    self.config.upcall_line_max_bytes,
                )?,
            };
            if let Err(e) = pipe.send_upcall(bytes) {
                pipe.pending.remove(&uid);
                msg.complete_with_error(e.clone());
                return Err(e);
            }
            debug!(uid, version = ?pipe.version, "upcall sent");
        } else {
            debug!(uid, "joined existing in-flight upcall");
        }
        Ok(msg)
    }

    /// Cold-path synchronous credential creation: waits (bounded) for a
    /// daemon if none is attached, then sends/joins the upcall and blocks
    /// until it completes or `cancel` fires.
    pub async fn request_sync(
        &self,
        pipe: &PipeChannel,
        uid: u32,
        principal: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Context>> {
        if !pipe.daemon_present() {
            let timeout = if self.registry.is_known_down() {
                self.config.daemon_down_retry_timeout
            } else {
                self.config.daemon_wait_timeout
            };
            self.registry.wait_for_change(timeout).await;
            if !pipe.daemon_present() {
                self.registry.mark_known_down();
                warn!(uid, "no daemon attached after wait, returning EACCES");
                return Err(GssAuthError::AccessDenied);
            }
        }
        let msg = self.dedup_and_send(pipe, uid, principal)?;
        msg.wait_sync(cancel).await
    }

    /// Refresh-path async upcall: never blocks. Sends/joins the upcall (or
    /// returns `EAGAIN` immediately if no daemon is attached) and invokes
    /// `on_done` when the downcall arrives.
    pub fn request_async(
        &self,
        pipe: &PipeChannel,
        uid: u32,
        principal: Option<&str>,
        on_done: impl FnOnce(std::result::Result<Arc<Context>, GssAuthError>) + Send + 'static,
    ) -> Result<()> {
        if !pipe.daemon_present() {
            return Err(GssAuthError::DaemonBusy);
        }
        let msg = self.dedup_and_send(pipe, uid, principal)?;
        msg.on_complete(on_done);
        Ok(())
    }
}

#[async_trait::async_trait]
impl PipeChannelCallbacks for UpcallCoordinator {
    async fn downcall(&self, pipe: &PipeChannel, bytes: &[u8]) -> Result<()> {
        // Read the uid first, independent of whether the rest of the
        // payload parses: a malformed tail (e.g. a seclen that overruns
        // the buffer) must still complete the right pending message with
        // a retryable error rather than leaving it stuck forever.
        let uid = match peek_downcall_uid(bytes) {
            Ok(uid) => uid,
            Err(err) => {
                warn!(%err, "downcall too short to contain a uid, dropping");
                return Ok(());
            }
        };
        let parsed = match decode_downcall(bytes, self.config.downcall_max_bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                // Unhash-then-wake, same ordering as the success path below.
                if let Some((_, msg)) = pipe.pending.remove(&uid) {
                    warn!(uid, %err, "downcall parse failure, completing pending upcall with a retryable error");
                    msg.complete_with_error(err);
                } else {
                    warn!(uid, %err, "downcall parse failure for unknown/expired upcall, dropping");
                }
                return Ok(());
            }
        };
        // Unhash-then-wake: remove from the pending set before completing
        // the message, so a woken waiter can never observe its own message
        // still in the pending set .
        let msg = match pipe.pending.remove(&parsed.uid) {
            Some((_, msg)) => msg,
            None => {
                warn!(uid = parsed.uid, "downcall for unknown/expired upcall, dropping");
                return Ok(());
            }
        };
        match parsed.outcome {
            DowncallOutcome::Error(errno) => {
                let err = if errno == -crate::error::EKEYEXPIRED {
                    GssAuthError::KeyExpired
                } else {
                    GssAuthError::AccessDenied
                };
                msg.complete_with_error(err);
            }
            DowncallOutcome::Success { wire_ctx, sec_blob } => {
                match self.provider.import_sec_context(&self.mechanism, &sec_blob) {
                    MechResult::Complete(handle) => {
                        let timeout = self
                            .config
                            .normalize_context_timeout(parsed.timeout_secs);
                        let ctx = Arc::new(Context::new(
                            self.provider.clone(),
                            handle,
                            wire_ctx,
                            timeout,
                            parsed.window,
                        ));
                        msg.complete_with_context(ctx);
                    }
                    MechResult::ContextExpired => {
                        // import-time expiry collapses to a retry rather
                        // than poisoning the credential, same bucket as
                        // the EFAULT/ENOMEM/EINVAL/ENOSYS row below.
                        msg.complete_with_error(GssAuthError::DaemonBusy);
                    }
                    MechResult::Failure(mech_err) => {
                        use crate::mechanism::MechError;
                        let err = match mech_err {
                            MechError::InvalidKey(_) => GssAuthError::AccessDenied,
                            MechError::VerificationFailed => GssAuthError::AccessDenied,
                            _ => GssAuthError::DaemonBusy,
                        };
                        msg.complete_with_error(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn destroy_msg(&self, msg: &Arc<UpcallMessage>) {
        if !msg.is_done() {
            msg.complete_with_error(GssAuthError::PipeClosed);
        }
    }
}

/// A token that is never cancelled, for callers with no kill-signal source
/// of their own (demo code, tests that don't exercise `ERESTARTSYS`).
pub fn uncancellable() -> CancellationToken {
    CancellationToken::new()
}
