//! Property-based tests: strictly increasing contiguous sequence numbers,
//! `set_ctx` idempotency once a context has been published, and
//! wrap_req/unwrap_resp round-tripping an arbitrary payload under both the
//! integrity and privacy services.

use std::sync::Arc;
use std::time::{Duration, Instant};

use proptest::prelude::*;

use gss_client::credential::{AuthCredRequest, CredCache, Context};
use gss_client::mechanism::MechanismProvider;
use gss_client::testing::{InMemoryXdrBuffer, LoopbackMechanism};
use gss_client::{new_authenticator, DaemonRegistry, GssProc, Mechanism, SecurityService, XdrBuffer};
use gss_config::GssConfig;

proptest! {
    /// `next_seqno` starts at 1 and is strictly monotonic with no gaps,
    /// for any number of calls on one context.
    #[test]
    fn seqnos_are_contiguous_from_one(n in 1usize..200) {
        let provider = LoopbackMechanism::new();
        let handle = provider.new_handle_for_test();
        let ctx = Context::new(Arc::new(provider), handle, vec![], Duration::from_secs(60), 16);
        for i in 1..=n {
            prop_assert_eq!(ctx.next_seqno(), i as u32);
        }
    }

    /// `set_ctx` only takes effect while `NEW` is set; once it has
    /// published a context, later calls are no-ops regardless of how many
    /// follow.
    #[test]
    fn set_ctx_only_takes_effect_once_while_new(extra_calls in 0usize..5) {
        let cache = CredCache::new();
        let req = AuthCredRequest { uid: 1, principal: None, machine_cred: false };
        let now = Instant::now();
        let cred = cache.get_or_create(&req, SecurityService::Integrity, now);

        let provider = Arc::new(LoopbackMechanism::new());
        let handle1 = LoopbackMechanism::new().new_handle_for_test();
        let ctx1 = Arc::new(Context::new(provider.clone(), handle1, vec![1], Duration::from_secs(60), 16));
        cred.set_ctx(ctx1.clone());
        prop_assert!(Arc::ptr_eq(&cred.get_ctx().unwrap(), &ctx1));

        for _ in 0..extra_calls {
            let handle2 = LoopbackMechanism::new().new_handle_for_test();
            let ctx2 = Arc::new(Context::new(provider.clone(), handle2, vec![2], Duration::from_secs(60), 16));
            cred.set_ctx(ctx2);
            prop_assert!(Arc::ptr_eq(&cred.get_ctx().unwrap(), &ctx1));
        }
    }

    /// wrap_req/unwrap_resp round-trips an arbitrary payload under both
    /// non-trivial security services (None is a passthrough, covered by the
    /// `proc != Data` branch already exercised in `auth.rs`'s own tests).
    #[test]
    fn wrap_unwrap_round_trips_arbitrary_payloads(
        payload in proptest::collection::vec(any::<u8>(), 0..256),
        use_privacy in any::<bool>(),
    ) {
        let service = if use_privacy { SecurityService::Privacy } else { SecurityService::Integrity };
        let registry = Arc::new(DaemonRegistry::new());
        let mechanism = Mechanism::new("krb5", "aes256-cts");
        let provider: Arc<dyn MechanismProvider> = Arc::new(LoopbackMechanism::new());
        let (auth, _ep0, _ep1) =
            new_authenticator(mechanism, service, provider.clone(), registry, GssConfig::default());

        let handle = LoopbackMechanism::new().new_handle_for_test();
        let ctx = Arc::new(Context::new(provider, handle, b"wire".to_vec(), Duration::from_secs(3600), 16));
        let cred_req = AuthCredRequest { uid: 1, principal: None, machine_cred: false };
        let cred = auth.cred_cache.get_or_create(&cred_req, service, Instant::now());
        cred.set_ctx(ctx);

        let mut buf = InMemoryXdrBuffer::with_xid(1);
        let seqno = auth.marshal(&cred, &mut buf).unwrap();

        let to_send = payload.clone();
        let wrap_start = buf.position();
        auth.wrap_req(&cred, GssProc::Data, seqno, &mut buf, &mut |b| {
            b.write_netobj(&to_send);
            Ok(())
        })
        .unwrap();

        // `unwrap_resp` inverts what `wrap_req` just produced as if it had
        // arrived back as a reply: a fresh buffer over that byte range,
        // cursor reset to 0, not `buf`'s own already-advanced cursor.
        let wrapped_frame = buf.as_slice()[wrap_start..].to_vec();
        let mut reply_buf = InMemoryXdrBuffer::from_bytes(wrapped_frame);

        let mut received = Vec::new();
        auth.unwrap_resp(&cred, GssProc::Data, seqno, &mut reply_buf, &mut |b| {
            received = b.read_netobj(4096)?;
            Ok(())
        })
        .unwrap();

        prop_assert_eq!(received, payload);
    }
}
