//! RPC Authenticator.
//!
//! Implements the runtime's auth-flavor contract: `marshal`, `validate`,
//! `wrap_req`, `unwrap_resp`, `refresh`, plus credential destruction.
//! Wire structures are written directly through the
//! [`crate::runtime::XdrBuffer`] seam rather than a standalone codec, since
//! the credential block and verifier are interleaved with the RPC call's
//! own XDR-encoded arguments in one buffer.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gss_config::GssConfig;

use crate::credential::{AuthCredRequest, CredCache, Credential, GssProc, RefreshDecision};
use crate::error::{GssAuthError, Result};
use crate::mechanism::{Mechanism, MechResult, MechanismProvider, SecurityService};
use crate::pipe::PipeChannel;
use crate::runtime::{RpcTask, XdrBuffer};
use crate::upcall::UpcallCoordinator;

/// RPCSEC_GSS's registered auth flavor number.
pub const AUTH_GSS: u32 = 6;

/// Maximum accepted length of an RPCSEC_GSS verifier opaque, a standard
/// ONC RPC ceiling reused here for the structural check in `validate`.
pub const RPC_MAX_AUTH_SIZE: u32 = 400;

/// Pre-allocated scratch reserved ahead of a privacy-wrapped request body
/// so `wrap`'s in-place output has head-room without reallocating the
/// whole call buffer.
pub const GSS_CRED_SLACK: usize = 1024;

/// A per-mount/per-client RPCSEC_GSS authenticator instance: owns a
/// Mechanism, a security service selector, both pipe versions, and the
/// credential cache.
pub struct Authenticator {
    pub mechanism: Arc<Mechanism>,
    pub service: SecurityService,
    pub pipe_v0: PipeChannel,
    pub pipe_v1: PipeChannel,
    pub coordinator: Arc<UpcallCoordinator>,
    pub cred_cache: CredCache,
    pub config: GssConfig,
    pub provider: Arc<dyn MechanismProvider>,
}

impl Authenticator {
    /// Which pipe a new upcall goes out on. v1 (textual, mechanism-tagged)
    /// is preferred whenever a daemon is attached to it; v0 exists only for
    /// a legacy daemon that never opens v1.
    fn active_pipe(&self) -> &PipeChannel {
        if self.pipe_v1.daemon_present() || !self.pipe_v0.daemon_present() {
            &self.pipe_v1
        } else {
            &self.pipe_v0
        }
    }

    /// Cold/warm path credential resolution for a synchronous caller: the
    /// refresh decision is driven to completion here rather than returned
    /// as `EAGAIN`, since a synchronous caller can afford to wait.
    pub async fn get_credential(
        &self,
        req: &AuthCredRequest,
        cancel: &CancellationToken,
    ) -> Result<Arc<Credential>> {
        let now = Instant::now();
        let cred = self.cred_cache.get_or_create(req, self.service, now);
        self.resolve_sync(cred, cancel).await
    }

    fn resolve_sync<'a>(
        &'a self,
        cred: Arc<Credential>,
        cancel: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Arc<Credential>>> + 'a>> {
        Box::pin(async move {
            let now = Instant::now();
            match self
                .cred_cache
                .decide_refresh(&cred, now, self.config.expired_cred_retry_delay)
            {
                RefreshDecision::AlreadyValid => Ok(cred),
                RefreshDecision::NegativeCooldown => Err(GssAuthError::KeyExpired),
                RefreshDecision::Rebind(fresh) => self.resolve_sync(fresh, cancel).await,
                RefreshDecision::Upcall => {
                    cred.record_upcall_attempt(now);
                    let pipe = self.active_pipe();
                    let result = self
                        .coordinator
                        .request_sync(pipe, cred.uid, cred.principal.as_deref(), cancel)
                        .await;
                    match result {
                        Ok(ctx) => {
                            cred.set_ctx(ctx);
                            Ok(cred)
                        }
                        Err(GssAuthError::KeyExpired) => {
                            cred.mark_negative(Instant::now());
                            Err(GssAuthError::KeyExpired)
                        }
                        Err(e) => Err(e),
                    }
                }
            }
        })
    }

    /// Refresh/renew, translated into the task's suspension model: never
    /// blocks the caller. On `EAGAIN` the task parks on the global
    /// version-wait queue; the async upcall keeps running in the
    /// background and completes the task later.
    pub fn refresh(&self, task: &Arc<dyn RpcTask>) -> Result<()> {
        let now = Instant::now();
        let cred = task.cred();
        match self
            .cred_cache
            .decide_refresh(&cred, now, self.config.expired_cred_retry_delay)
        {
            RefreshDecision::AlreadyValid => {
                task.complete_ok();
                Ok(())
            }
            RefreshDecision::NegativeCooldown => {
                task.complete_with_error(GssAuthError::KeyExpired);
                Err(GssAuthError::KeyExpired)
            }
            RefreshDecision::Rebind(fresh) => {
                task.set_cred(fresh);
                self.refresh(task)
            }
            RefreshDecision::Upcall => {
                cred.record_upcall_attempt(now);
                let pipe = self.active_pipe();
                if !pipe.daemon_present() {
                    task.park_on_version_wait();
                    return Err(GssAuthError::DaemonBusy);
                }
                let cred_for_cb = cred.clone();
                let task_for_cb = task.clone();
                self.coordinator.request_async(
                    pipe,
                    cred.uid,
                    cred.principal.as_deref(),
                    move |result| match result {
                        Ok(ctx) => {
                            cred_for_cb.set_ctx(ctx);
                            task_for_cb.complete_ok();
                        }
                        Err(GssAuthError::KeyExpired) => {
                            cred_for_cb.mark_negative(Instant::now());
                            task_for_cb.complete_with_error(GssAuthError::KeyExpired);
                        }
                        Err(e) => task_for_cb.complete_with_error(e),
                    },
                )?;
                Err(GssAuthError::DaemonBusy)
            }
        }
    }

    /// `marshal(task, buf)`: emits the RPCSEC_GSS credential block and
    /// verifier. Returns the sequence number used, which the caller must
    /// thread through to `wrap_req`/`validate`/`unwrap_resp` for the same
    /// call.
    pub fn marshal(&self, cred: &Credential, buf: &mut dyn XdrBuffer) -> Result<u32> {
        let ctx = cred.get_ctx().ok_or(GssAuthError::AccessDenied)?;
        let proc = ctx.proc();
        let seqno = ctx.next_seqno();

        let xid_offset = buf.xid_offset();
        buf.write_u32(AUTH_GSS);
        let len_off = buf.position();
        buf.write_u32(0); // cred_body_len placeholder
        let body_start = buf.position();
        buf.write_u32(1); // version
        buf.write_u32(proc as u32);
        buf.write_u32(seqno);
        buf.write_u32(self.service as u32);
        buf.write_netobj(&ctx.wire_ctx);
        let body_end = buf.position();
        buf.backfill_u32(len_off, (body_end - body_start) as u32);

        let mic_range = buf.slice(xid_offset..body_end).to_vec();
        let mic_result = ctx
            .with_handle(|h| self.provider.get_mic(h, &mic_range))
            .ok_or(GssAuthError::AccessDenied)?;
        match mic_result {
            MechResult::Complete(mic) => {
                buf.write_u32(AUTH_GSS);
                buf.write_netobj(&mic);
                debug!(uid = cred.uid, seqno, ?proc, "marshalled RPCSEC_GSS credential");
                Ok(seqno)
            }
            MechResult::ContextExpired => {
                // Clear UPTODATE and continue: the marshalled call will fail
                // on the server and drive a refresh, rather than aborting
                // the call here.
                cred.clear_uptodate();
                buf.write_u32(AUTH_GSS);
                buf.write_netobj(&[]);
                Ok(seqno)
            }
            MechResult::Failure(e) => Err(GssAuthError::MechanismFailure(e)),
        }
    }

    /// `validate(task, buf)`: checks the reply's auth verifier. Returns the
    /// verifier's total wire footprint (flavor + length + mic bytes) so the
    /// caller can fold it into the RPC runtime's reply slack accounting,
    ///
    pub fn validate(&self, cred: &Credential, buf: &mut dyn XdrBuffer, seqno: u32) -> Result<usize> {
        let flavor = buf.read_u32()?;
        let length = buf.read_u32()?;
        if flavor != AUTH_GSS {
            return Err(GssAuthError::InvalidVerifier(format!(
                "unexpected verifier flavor {flavor}"
            )));
        }
        if length > RPC_MAX_AUTH_SIZE {
            return Err(GssAuthError::InvalidVerifier(format!(
                "verifier length {length} exceeds RPC_MAX_AUTH_SIZE"
            )));
        }
        let mic = buf.read_bytes(length as usize)?;
        let ctx = cred.get_ctx().ok_or(GssAuthError::AccessDenied)?;

        // The server MICs the raw integer value of the sequence number,
        // not an XDR encoding choice
        let scratch = seqno.to_be_bytes();
        let result = ctx
            .with_handle(|h| self.provider.verify_mic(h, &scratch, &mic))
            .ok_or(GssAuthError::AccessDenied)?;
        match result {
            MechResult::Complete(()) => Ok(8 + mic.len()),
            MechResult::ContextExpired => {
                cred.clear_uptodate();
                Ok(8 + mic.len())
            }
            MechResult::Failure(e) => Err(GssAuthError::MechanismFailure(e)),
        }
    }

    /// `wrap_req(task, encode, obj, buf)`:
    pub fn wrap_req(
        &self,
        cred: &Credential,
        proc: GssProc,
        seqno: u32,
        buf: &mut dyn XdrBuffer,
        encode: &mut dyn FnMut(&mut dyn XdrBuffer) -> Result<()>,
    ) -> Result<()> {
        if proc != GssProc::Data || self.service == SecurityService::None {
            return encode(buf);
        }
        let ctx = cred.get_ctx().ok_or(GssAuthError::AccessDenied)?;
        match self.service {
            SecurityService::None => unreachable!(),
            SecurityService::Integrity => {
                let len_off = buf.position();
                buf.write_u32(0);
                let body_start = buf.position();
                buf.write_u32(seqno);
                encode(buf)?;
                let body_end = buf.position();
                buf.backfill_u32(len_off, (body_end - body_start) as u32);
                let body = buf.slice(body_start..body_end).to_vec();
                let result = ctx
                    .with_handle(|h| self.provider.get_mic(h, &body))
                    .ok_or(GssAuthError::AccessDenied)?;
                match result {
                    MechResult::Complete(mic) => {
                        buf.write_netobj(&mic);
                        Ok(())
                    }
                    MechResult::ContextExpired => {
                        cred.clear_uptodate();
                        buf.write_netobj(&[]);
                        Ok(())
                    }
                    MechResult::Failure(e) => Err(GssAuthError::MechanismFailure(e)),
                }
            }
            SecurityService::Privacy => {
                let len_off = buf.position();
                buf.write_u32(0);
                let body_start = buf.position();
                buf.write_u32(seqno);
                encode(buf)?;
                // Duplicate the tail onto its own allocation so `wrap`'s
                // in-place output has head-room: the GSS_CRED_SLACK
                // reservation is what makes this safe without reallocating
                // the whole call buffer.
                let tail = buf.duplicate_tail_for_wrap(body_start);
                let result = ctx
                    .with_handle(|h| self.provider.wrap(h, &tail, true))
                    .ok_or(GssAuthError::AccessDenied)?;
                match result {
                    MechResult::Complete(wrapped) => {
                        buf.replace_tail(body_start, &wrapped);
                        let end = buf.position();
                        buf.backfill_u32(len_off, (end - body_start) as u32);
                        buf.pad_to(4);
                        Ok(())
                    }
                    MechResult::ContextExpired => {
                        cred.clear_uptodate();
                        buf.replace_tail(body_start, &tail);
                        let end = buf.position();
                        buf.backfill_u32(len_off, (end - body_start) as u32);
                        buf.pad_to(4);
                        Ok(())
                    }
                    MechResult::Failure(e) => Err(GssAuthError::MechanismFailure(e)),
                }
            }
        }
    }

    /// `unwrap_resp(task, decode, obj, buf)`: inverse of `wrap_req`.
    pub fn unwrap_resp(
        &self,
        cred: &Credential,
        proc: GssProc,
        seqno: u32,
        buf: &mut dyn XdrBuffer,
        decode: &mut dyn FnMut(&mut dyn XdrBuffer) -> Result<()>,
    ) -> Result<()> {
        if proc != GssProc::Data || self.service == SecurityService::None {
            return decode(buf);
        }
        let ctx = cred.get_ctx().ok_or(GssAuthError::AccessDenied)?;
        match self.service {
            SecurityService::None => unreachable!(),
            SecurityService::Integrity => {
                // `read_bytes` bounds-checks `len` against the buffer's
                // actual remaining length, turning a corrupt/oversized
                // length prefix into a retryable decode error rather than
                // an unbounded allocation.
                let len = buf.read_u32()? as usize;
                let body = buf.read_bytes(len)?;
                let mic = buf.read_netobj(RPC_MAX_AUTH_SIZE as usize)?;
                if body.len() < 4 {
                    return Err(GssAuthError::Decode(gss_io::IoError::end_of_stream(
                        4 - body.len(),
                        "integrity body seqno",
                    )));
                }
                let result = ctx
                    .with_handle(|h| self.provider.verify_mic(h, &body, &mic))
                    .ok_or(GssAuthError::AccessDenied)?;
                let expired = match result {
                    MechResult::Complete(()) => false,
                    MechResult::ContextExpired => {
                        cred.clear_uptodate();
                        true
                    }
                    MechResult::Failure(e) => return Err(GssAuthError::MechanismFailure(e)),
                };
                let got_seqno = u32::from_be_bytes(body[0..4].try_into().unwrap());
                if !expired && got_seqno != seqno {
                    return Err(GssAuthError::InvalidVerifier(format!(
                        "reply seqno {got_seqno} does not match request seqno {seqno}"
                    )));
                }
                let mut payload = buf.new_sub_buffer(body[4..].to_vec());
                decode(payload.as_mut())
            }
            SecurityService::Privacy => {
                let len = buf.read_u32()? as usize;
                let wrapped = buf.read_bytes(len)?;
                let result = ctx
                    .with_handle(|h| self.provider.unwrap(h, &wrapped, true))
                    .ok_or(GssAuthError::AccessDenied)?;
                match result {
                    MechResult::Complete(plain) => {
                        if plain.len() < 4 {
                            return Err(GssAuthError::Decode(gss_io::IoError::end_of_stream(
                                4 - plain.len(),
                                "privacy body seqno",
                            )));
                        }
                        let got_seqno = u32::from_be_bytes(plain[0..4].try_into().unwrap());
                        if got_seqno != seqno {
                            return Err(GssAuthError::InvalidVerifier(format!(
                                "reply seqno {got_seqno} does not match request seqno {seqno}"
                            )));
                        }
                        let mut payload = buf.new_sub_buffer(plain[4..].to_vec());
                        decode(payload.as_mut())
                    }
                    MechResult::ContextExpired => {
                        cred.clear_uptodate();
                        Ok(())
                    }
                    MechResult::Failure(e) => Err(GssAuthError::MechanismFailure(e)),
                }
            }
        }
    }

    /// Destroys a Credential: best-effort marshals a `DESTROY`-proc NULL
    /// RPC (actually sending it is the host transport's job, out of scope
    /// here), then drops this crate's reference to the Credential so its
    /// Context is freed once the last in-flight reference elsewhere also
    /// drops.
    pub fn destroy_credential(&self, cred: &Arc<Credential>, buf: &mut dyn XdrBuffer) {
        if let Some(ctx) = cred.get_ctx() {
            ctx.mark_for_destroy();
            match self.marshal(cred, buf) {
                Ok(seqno) => debug!(uid = cred.uid, seqno, "best-effort DESTROY RPC marshalled"),
                Err(e) => warn!(uid = cred.uid, error = %e, "failed to marshal best-effort DESTROY RPC"),
            }
        }
        self.cred_cache.remove(cred);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{AuthCredRequest, Context};
    use crate::pipe::DaemonRegistry;
    use crate::testing::{InMemoryXdrBuffer, LoopbackMechanism};

    fn build(service: SecurityService) -> (Authenticator, Arc<Credential>) {
        let registry = Arc::new(DaemonRegistry::new());
        let mechanism = Mechanism::new("krb5", "aes256-cts");
        let provider: Arc<dyn MechanismProvider> = Arc::new(LoopbackMechanism::new());
        let (auth, _ep0, _ep1) =
            crate::new_authenticator(mechanism, service, provider.clone(), registry, GssConfig::default());

        let handle = LoopbackMechanism::new().new_handle_for_test();
        let ctx = Arc::new(Context::new(provider, handle, b"wire".to_vec(), std::time::Duration::from_secs(3600), 16));
        let req = AuthCredRequest {
            uid: 1,
            principal: None,
            machine_cred: false,
        };
        let cred = auth.cred_cache.get_or_create(&req, service, Instant::now());
        cred.set_ctx(ctx);
        (auth, cred)
    }

    /// A verifier whose length exceeds `RPC_MAX_AUTH_SIZE` fails validation
    /// without mutating Context state, except possibly clearing UPTODATE.
    /// The structural rejection happens before the mic is even read, so
    /// UPTODATE must still be set afterwards.
    #[test]
    fn validate_rejects_oversized_verifier_length() {
        let (auth, cred) = build(SecurityService::Integrity);
        let mut buf = InMemoryXdrBuffer::new();
        buf.write_u32(AUTH_GSS);
        buf.write_u32(RPC_MAX_AUTH_SIZE + 1);

        let err = auth.validate(&cred, &mut buf, 1).unwrap_err();
        assert!(matches!(err, GssAuthError::InvalidVerifier(_)));
        assert!(
            cred.flags().contains(crate::credential::CredFlags::UPTODATE),
            "a structural verifier rejection must not touch UPTODATE"
        );
    }

    /// A verifier flavor other than AUTH_GSS is rejected the same way,
    /// independent of the length check.
    #[test]
    fn validate_rejects_wrong_flavor() {
        let (auth, cred) = build(SecurityService::Integrity);
        let mut buf = InMemoryXdrBuffer::new();
        buf.write_u32(99);
        buf.write_u32(0);

        let err = auth.validate(&cred, &mut buf, 1).unwrap_err();
        assert!(matches!(err, GssAuthError::InvalidVerifier(_)));
    }

    /// marshal/validate round trip: a MIC produced by `marshal` over a call
    /// buffer verifies under `validate` when the server MICs the same
    /// sequence number back.
    #[test]
    fn marshal_then_validate_round_trips() {
        let (auth, cred) = build(SecurityService::Integrity);
        let mut buf = InMemoryXdrBuffer::with_xid(1);
        let seqno = auth.marshal(&cred, &mut buf).unwrap();

        let mic = cred
            .get_ctx()
            .unwrap()
            .with_handle(|h| auth.provider.get_mic(h, &seqno.to_be_bytes()))
            .unwrap();
        let mic = match mic {
            MechResult::Complete(mic) => mic,
            _ => panic!("expected a complete mic"),
        };

        let mut reply = InMemoryXdrBuffer::new();
        reply.write_u32(AUTH_GSS);
        reply.write_u32(mic.len() as u32);
        reply.write_bytes(&mic);

        auth.validate(&cred, &mut reply, seqno).unwrap();
        assert!(cred.flags().contains(crate::credential::CredFlags::UPTODATE));
    }
}
