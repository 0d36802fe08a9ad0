//! Credential cache and the shared GSS security context.
//!
//! `Context` is the shared GSS security context: published once, immutable
//! except for its sequence counter, freed only once the last `Arc` clone
//! drops. The Arc itself is the grace period. `Credential` is the
//! per-(uid, principal) cache entry that points at one `Context` at a time
//! through an `ArcSwapOption`, giving lock-free reads on the warm path.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bitflags::bitflags;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::mechanism::{MechContextHandle, MechanismProvider, SecurityService};

/// The RPCSEC_GSS procedure code carried in a credential block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GssProc {
    Data = 0,
    Init = 1,
    ContinueInit = 2,
    Destroy = 3,
}

/// The shared GSS security context.
///
/// Reference-counted via `Arc<Context>`; never mutated after construction
/// except for [`Context::next_seqno`] (an atomic counter) and the one-shot
/// [`Context::mark_for_destroy`] rewrite of the procedure code on teardown.
pub struct Context {
    /// Opaque mechanism-specific handle. Held behind a mutex purely so
    /// `Drop` can take ownership and hand it back to the provider for
    /// `delete_sec_context`. Never locked on the read/marshal fast path,
    /// since [`Context::with_handle`] only needs a borrow, not removal.
    handle: Mutex<Option<Box<dyn MechContextHandle>>>,
    provider: Arc<dyn MechanismProvider>,
    /// The opaque bytes the server expects to see verbatim in every
    /// credential block.
    pub wire_ctx: Vec<u8>,
    expiry: Instant,
    proc: AtomicU8,
    /// Server-advertised sequence window; informational in this client.
    pub window: u32,
    /// Starts at 1, strictly monotonic, never reused. A plain atomic
    /// `fetch_add` serialises allocation without a separate lock.
    next_seq: AtomicU64,
}

impl Context {
    pub fn new(
        provider: Arc<dyn MechanismProvider>,
        handle: Box<dyn MechContextHandle>,
        wire_ctx: Vec<u8>,
        lifetime: Duration,
        window: u32,
    ) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
            provider,
            wire_ctx,
            expiry: Instant::now() + lifetime,
            proc: AtomicU8::new(GssProc::Data as u8),
            window,
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiry
    }

    pub fn expiry(&self) -> Instant {
        self.expiry
    }

    /// Allocates the next sequence number for a `marshal` call: strictly
    /// monotonic, starts at 1.
    pub fn next_seqno(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) as u32
    }

    pub fn proc(&self) -> GssProc {
        match self.proc.load(Ordering::SeqCst) {
            1 => GssProc::Init,
            2 => GssProc::ContinueInit,
            3 => GssProc::Destroy,
            _ => GssProc::Data,
        }
    }

    /// One-shot rewrite to `DESTROY`, reachable only once the owning
    /// Credential is being torn down and no other caller can observe the
    /// "immutable" invariant being broken.
    pub fn mark_for_destroy(&self) {
        self.proc.store(GssProc::Destroy as u8, Ordering::SeqCst);
    }

    /// Borrows the mechanism handle for a provider call. Returns `None`
    /// only if the context has already been torn down (handle taken by
    /// `Drop`), which should not happen while any `Arc<Context>` is alive.
    pub fn with_handle<R>(&self, f: impl FnOnce(&dyn MechContextHandle) -> R) -> Option<R> {
        let guard = self.handle.lock();
        guard.as_deref().map(f)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("wire_ctx_len", &self.wire_ctx.len())
            .field("window", &self.window)
            .field("proc", &self.proc())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            self.provider.delete_sec_context(handle);
        }
    }
}

bitflags! {
    /// Credential status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CredFlags: u8 {
        const NEW = 0b001;
        const UPTODATE = 0b010;
        const NEGATIVE = 0b100;
    }
}

/// Identifies a cache entry: (uid, principal).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredKey {
    pub uid: u32,
    pub principal: Option<String>,
}

/// Request shape consumed by [`CredCache::get_or_create`]: the `acred` the
/// host RPC runtime hands the cache.
#[derive(Debug, Clone)]
pub struct AuthCredRequest {
    pub uid: u32,
    pub principal: Option<String>,
    /// Whether the caller marked this as a "machine cred": only then is
    /// `principal` copied onto the new Credential.
    pub machine_cred: bool,
}

/// The per-(uid, principal) cache entry.
pub struct Credential {
    pub uid: u32,
    pub principal: Option<String>,
    pub service: SecurityService,
    flags: AtomicU8,
    /// Lock-free publication point for the current Context: readers never
    /// block.
    ctx: ArcSwapOption<Context>,
    last_upcall_time: Mutex<Option<Instant>>,
}

impl Credential {
    fn new_new(uid: u32, principal: Option<String>, service: SecurityService) -> Arc<Self> {
        Arc::new(Self {
            uid,
            principal,
            service,
            flags: AtomicU8::new(CredFlags::NEW.bits()),
            ctx: ArcSwapOption::from(None),
            last_upcall_time: Mutex::new(None),
        })
    }

    pub fn flags(&self) -> CredFlags {
        CredFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    fn set_flags(&self, flags: CredFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn key(&self) -> CredKey {
        CredKey {
            uid: self.uid,
            principal: self.principal.clone(),
        }
    }

    /// Lock-free read of the current Context.
    pub fn get_ctx(&self) -> Option<Arc<Context>> {
        self.ctx.load_full()
    }

    /// Publication point. A no-op unless `NEW` is set on entry. The
    /// `ArcSwapOption::store` is the release-store publish: a lock-free
    /// `get_ctx` either sees the prior value (still valid, kept alive by
    /// its own `Arc` clones) or this fully-initialised one, never a
    /// half-built Context.
    pub fn set_ctx(&self, ctx: Arc<Context>) {
        let mut flags = self.flags();
        if !flags.contains(CredFlags::NEW) {
            return;
        }
        self.ctx.store(Some(ctx));
        flags.insert(CredFlags::UPTODATE);
        flags.remove(CredFlags::NEW);
        flags.remove(CredFlags::NEGATIVE);
        self.set_flags(flags);
    }

    /// Whether this Credential is currently usable without a refresh:
    /// `UPTODATE` set and its Context not expired.
    pub fn is_valid(&self) -> bool {
        self.flags().contains(CredFlags::UPTODATE)
            && self
                .get_ctx()
                .map(|ctx| !ctx.is_expired())
                .unwrap_or(false)
    }

    /// Daemon reported the security context's key has expired: enters the
    /// `NEGATIVE` cooling-off window.
    pub fn mark_negative(&self, now: Instant) {
        let mut flags = self.flags();
        flags.insert(CredFlags::NEGATIVE);
        flags.remove(CredFlags::UPTODATE);
        self.set_flags(flags);
        *self.last_upcall_time.lock() = Some(now);
    }

    /// A provider call returned `context-expired`: clear `UPTODATE` and let
    /// renewal take over, without touching `NEW`/`NEGATIVE`.
    pub fn clear_uptodate(&self) {
        let mut flags = self.flags();
        flags.remove(CredFlags::UPTODATE);
        self.set_flags(flags);
    }

    pub fn last_upcall_time(&self) -> Option<Instant> {
        *self.last_upcall_time.lock()
    }

    pub fn record_upcall_attempt(&self, now: Instant) {
        *self.last_upcall_time.lock() = Some(now);
    }
}

/// Outcome of [`CredCache::decide_refresh`].
pub enum RefreshDecision {
    /// Already `UPTODATE` with a live Context: nothing to do.
    AlreadyValid,
    /// `NEGATIVE` and still inside the cooling-off window.
    NegativeCooldown,
    /// Credential went stale (neither `NEW` nor `UPTODATE`): rebind to this
    /// freshly looked-up-or-created Credential instead of mutating in place.
    Rebind(Arc<Credential>),
    /// `NEW`: the caller should drive the upcall coordinator.
    Upcall,
}

/// The host-supplied generic credential cache, specialised to this crate's
/// `match`/`create` callbacks.
///
/// Backed by a `dashmap::DashMap` for per-key locking, matching the
/// concurrent-peer-map pattern used elsewhere in this workspace.
#[derive(Default)]
pub struct CredCache {
    entries: DashMap<CredKey, Arc<Credential>>,
}

impl CredCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `match(acred, cred)` + `create(acred)` combined: returns the cached
    /// Credential if it still matches, otherwise creates and inserts a new
    /// `NEW` one.
    pub fn get_or_create(
        &self,
        req: &AuthCredRequest,
        service: SecurityService,
        now: Instant,
    ) -> Arc<Credential> {
        let key = CredKey {
            uid: req.uid,
            principal: req.principal.clone(),
        };
        if let Some(existing) = self.entries.get(&key) {
            if Self::matches(&existing, now) {
                return existing.clone();
            }
        }
        let principal = if req.machine_cred {
            req.principal.clone()
        } else {
            None
        };
        let cred = Credential::new_new(req.uid, principal, service);
        self.entries.insert(key, cred.clone());
        cred
    }

    /// `match(acred, cred)`: NEW credentials always match (they will be
    /// resolved); non-NEW credentials additionally require `UPTODATE` and
    /// `now < ctx.expiry`.
    fn matches(cred: &Credential, now: Instant) -> bool {
        let flags = cred.flags();
        if flags.contains(CredFlags::NEW) {
            return true;
        }
        flags.contains(CredFlags::UPTODATE)
            && cred
                .get_ctx()
                .map(|ctx| now < ctx.expiry())
                .unwrap_or(false)
    }

    /// Decides whether `cred` needs a fresh upcall: a `NEGATIVE` credential
    /// still inside its retry cooldown is left alone, a credential that is
    /// neither `NEW` nor `UPTODATE` gets a brand new acquisition request, and
    /// anything else is handed back as-is.
    pub fn decide_refresh(
        &self,
        cred: &Arc<Credential>,
        now: Instant,
        retry_delay: Duration,
    ) -> RefreshDecision {
        let flags = cred.flags();
        if flags.contains(CredFlags::NEGATIVE) {
            if let Some(last) = cred.last_upcall_time() {
                if now < last + retry_delay {
                    return RefreshDecision::NegativeCooldown;
                }
            }
        }
        if !flags.contains(CredFlags::NEW) && !flags.contains(CredFlags::UPTODATE) {
            let req = AuthCredRequest {
                uid: cred.uid,
                principal: cred.principal.clone(),
                machine_cred: cred.principal.is_some(),
            };
            let fresh = self.get_or_create(&req, cred.service, now);
            return RefreshDecision::Rebind(fresh);
        }
        if flags.contains(CredFlags::NEW) {
            return RefreshDecision::Upcall;
        }
        RefreshDecision::AlreadyValid
    }

    /// Removes a Credential from the cache, e.g. on destruction.
    pub fn remove(&self, cred: &Credential) {
        self.entries.remove(&cred.key());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_ctx_is_noop_without_new() {
        let cred = Credential::new_new(1000, None, SecurityService::Integrity);
        cred.set_flags(CredFlags::UPTODATE);
        assert!(cred.get_ctx().is_none());
        let provider = crate::testing::LoopbackMechanism::new();
        let handle = provider.new_handle_for_test();
        let ctx = Arc::new(Context::new(
            Arc::new(provider),
            handle,
            vec![1, 2],
            Duration::from_secs(60),
            16,
        ));
        cred.set_ctx(ctx);
        // UPTODATE was already set, NEW was not: set_ctx must be a no-op.
        assert!(cred.get_ctx().is_none());
        assert!(cred.flags().contains(CredFlags::UPTODATE));
    }

    #[test]
    fn set_ctx_publishes_when_new() {
        let cred = Credential::new_new(1000, None, SecurityService::Integrity);
        assert!(cred.flags().contains(CredFlags::NEW));
        let provider = Arc::new(crate::testing::LoopbackMechanism::new());
        let handle = provider.new_handle_for_test();
        let ctx = Arc::new(Context::new(
            provider,
            handle,
            vec![1, 2],
            Duration::from_secs(60),
            16,
        ));
        cred.set_ctx(ctx);
        assert!(cred.get_ctx().is_some());
        assert!(cred.flags().contains(CredFlags::UPTODATE));
        assert!(!cred.flags().contains(CredFlags::NEW));
    }

    #[test]
    fn negative_cooldown_blocks_refresh_until_delay_elapses() {
        let cache = CredCache::new();
        let req = AuthCredRequest {
            uid: 1000,
            principal: None,
            machine_cred: false,
        };
        let now = Instant::now();
        let cred = cache.get_or_create(&req, SecurityService::Integrity, now);
        cred.mark_negative(now);
        let decision = cache.decide_refresh(&cred, now, Duration::from_secs(5));
        assert!(matches!(decision, RefreshDecision::NegativeCooldown));
    }

    #[test]
    fn sequence_numbers_start_at_one_and_increase() {
        let provider = Arc::new(crate::testing::LoopbackMechanism::new());
        let handle = provider.new_handle_for_test();
        let ctx = Context::new(provider, handle, vec![], Duration::from_secs(60), 16);
        assert_eq!(ctx.next_seqno(), 1);
        assert_eq!(ctx.next_seqno(), 2);
        assert_eq!(ctx.next_seqno(), 3);
    }
}
