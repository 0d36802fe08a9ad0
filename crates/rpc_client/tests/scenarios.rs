//! End-to-end scenarios driven against an in-process test daemon (a tokio
//! task reading upcalls off a [`PipeEndpoint`] and writing back hand-built
//! [`Downcall`]s) rather than a real rpc.gssd.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gss_client::credential::AuthCredRequest;
use gss_client::pipe::{
    decode_upcall_v1, encode_downcall, DaemonRegistry, Downcall, DowncallOutcome, PipeChannelCallbacks,
    PipeEndpoint,
};
use gss_client::testing::LoopbackMechanism;
use gss_client::{new_authenticator, Authenticator, CredFlags, Mechanism, SecurityService, XdrBuffer};
use gss_config::GssConfig;

/// Fast-timeout config so the daemon-absence paths  don't
/// actually burn 15 real seconds in a test.
fn fast_config() -> GssConfig {
    let mut cfg = GssConfig::default();
    cfg.daemon_wait_timeout = Duration::from_millis(150);
    cfg.daemon_down_retry_timeout = Duration::from_millis(30);
    cfg
}

fn build(config: GssConfig) -> (Arc<Authenticator>, PipeEndpoint, PipeEndpoint) {
    let registry = Arc::new(DaemonRegistry::new());
    let mechanism = Mechanism::new("krb5", "aes256-cts");
    let provider = Arc::new(LoopbackMechanism::new());
    let (auth, ep0, ep1) = new_authenticator(mechanism, SecurityService::Integrity, provider, registry, config);
    (Arc::new(auth), ep0, ep1)
}

/// Runs a trivial in-process daemon on the v1 pipe: attaches, then answers
/// every upcall with whatever `responder` builds for it.
async fn run_v1_daemon(
    auth: Arc<Authenticator>,
    mut endpoint: PipeEndpoint,
    mut responder: impl FnMut(u32, String) -> Downcall + Send + 'static,
) {
    assert!(endpoint.open_daemon(), "v1 pipe should not already be latched to v0");
    while let Some(bytes) = endpoint.recv_upcall().await {
        let (uid, mech) = decode_upcall_v1(&bytes, auth.config.upcall_line_max_bytes).unwrap();
        let downcall = responder(uid, mech);
        let encoded = encode_downcall(&downcall);
        endpoint
            .write_downcall(&auth.pipe_v1, auth.coordinator.as_ref() as &dyn PipeChannelCallbacks, &encoded)
            .await
            .unwrap();
    }
}

/// S1: cold credential creation, then a warm re-use that never re-upcalls.
#[tokio::test]
async fn s1_cold_credential_then_warm_reuse() {
    let (auth, _ep0, ep1) = build(fast_config());
    let upcalls = Arc::new(AtomicUsize::new(0));
    let counted = upcalls.clone();
    tokio::spawn(run_v1_daemon(auth.clone(), ep1, move |uid, _mech| {
        counted.fetch_add(1, Ordering::SeqCst);
        Downcall {
            uid,
            timeout_secs: 3600,
            window: 128,
            outcome: DowncallOutcome::Success {
                wire_ctx: b"AA".to_vec(),
                sec_blob: vec![1, 2, 3, 4],
            },
        }
    }));
    // Let the daemon task attach before the cold request races it.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let req = AuthCredRequest {
        uid: 1000,
        principal: None,
        machine_cred: false,
    };
    let cancel = CancellationToken::new();

    let cred = auth.get_credential(&req, &cancel).await.expect("cold path succeeds");
    assert!(cred.flags().contains(CredFlags::UPTODATE));
    let ctx = cred.get_ctx().expect("uptodate credential has a context");
    assert_eq!(ctx.wire_ctx, b"AA");
    assert_eq!(upcalls.load(Ordering::SeqCst), 1);

    // Warm reuse: same credential, no second upcall.
    let warm = auth.get_credential(&req, &cancel).await.expect("warm path succeeds");
    assert!(Arc::ptr_eq(&cred, &warm));
    assert_eq!(upcalls.load(Ordering::SeqCst), 1, "warm reuse must not re-upcall");

    let mut buf = gss_client::testing::InMemoryXdrBuffer::with_xid(42);
    let seqno = auth.marshal(&cred, &mut buf).unwrap();
    assert_eq!(seqno, 1, "first marshal on a fresh context starts at seqno 1");
    let seqno2 = auth.marshal(&cred, &mut buf).unwrap();
    assert_eq!(seqno2, 2, "sequence numbers are strictly increasing");
}

/// S2: no daemon ever attaches. The synchronous path waits out
/// `daemon_wait_timeout` then surfaces `EACCES`, and a second call right
/// behind it fails fast using the shortened `daemon_down_retry_timeout`.
#[tokio::test]
async fn s2_daemon_down_times_out_then_fails_fast() {
    let (auth, _ep0, _ep1) = build(fast_config());
    let req = AuthCredRequest {
        uid: 2000,
        principal: None,
        machine_cred: false,
    };
    let cancel = CancellationToken::new();

    let start = tokio::time::Instant::now();
    let err = auth.get_credential(&req, &cancel).await.unwrap_err();
    let elapsed = start.elapsed();
    assert_eq!(err, gss_client::GssAuthError::AccessDenied);
    assert!(elapsed >= Duration::from_millis(140), "should have waited out the full daemon_wait_timeout");

    // Second attempt on the same uid re-creates a NEW credential (the first
    // attempt never installed a context) and should fail using the
    // shortened retry timeout rather than the full wait.
    let start = tokio::time::Instant::now();
    let err = auth.get_credential(&req, &cancel).await.unwrap_err();
    let elapsed = start.elapsed();
    assert_eq!(err, gss_client::GssAuthError::AccessDenied);
    assert!(elapsed < Duration::from_millis(140), "known-down retry must be short");
}

/// S3: the daemon reports an expired key; the credential enters its
/// `NEGATIVE` cooldown and a retry inside the cooldown window never
/// contacts the daemon again.
#[tokio::test]
async fn s3_expired_key_enters_negative_cooldown() {
    let mut cfg = fast_config();
    cfg.expired_cred_retry_delay = Duration::from_secs(30);
    let (auth, _ep0, ep1) = build(cfg);
    let upcalls = Arc::new(AtomicUsize::new(0));
    let counted = upcalls.clone();
    tokio::spawn(run_v1_daemon(auth.clone(), ep1, move |uid, _mech| {
        counted.fetch_add(1, Ordering::SeqCst);
        Downcall {
            uid,
            timeout_secs: 0,
            window: 0,
            outcome: DowncallOutcome::Error(-gss_client::error::EKEYEXPIRED),
        }
    }));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let req = AuthCredRequest {
        uid: 3000,
        principal: None,
        machine_cred: false,
    };
    let cancel = CancellationToken::new();

    let err = auth.get_credential(&req, &cancel).await.unwrap_err();
    assert_eq!(err, gss_client::GssAuthError::KeyExpired);
    assert_eq!(upcalls.load(Ordering::SeqCst), 1);

    // Still inside the cooldown: must fail the same way without another upcall.
    let err = auth.get_credential(&req, &cancel).await.unwrap_err();
    assert_eq!(err, gss_client::GssAuthError::KeyExpired);
    assert_eq!(upcalls.load(Ordering::SeqCst), 1, "cooldown must suppress a second upcall");
}

/// S4: many concurrent callers asking for the same uid collapse onto one
/// upcall and all observe the same resulting `Context`.
#[tokio::test]
async fn s4_concurrent_requests_dedup_to_one_upcall() {
    let (auth, _ep0, ep1) = build(fast_config());
    let upcalls = Arc::new(AtomicUsize::new(0));
    let counted = upcalls.clone();
    tokio::spawn(run_v1_daemon(auth.clone(), ep1, move |uid, _mech| {
        counted.fetch_add(1, Ordering::SeqCst);
        Downcall {
            uid,
            timeout_secs: 3600,
            window: 128,
            outcome: DowncallOutcome::Success {
                wire_ctx: b"BB".to_vec(),
                sec_blob: vec![9, 9, 9],
            },
        }
    }));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let req = AuthCredRequest {
        uid: 4000,
        principal: None,
        machine_cred: false,
    };
    let cancel = CancellationToken::new();

    let mut handles = Vec::new();
    for _ in 0..64 {
        let auth = auth.clone();
        let req = req.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { auth.get_credential(&req, &cancel).await }));
    }
    let results = futures::future::join_all(handles).await;
    let creds: Vec<_> = results
        .into_iter()
        .map(|r| r.expect("task did not panic").expect("credential resolves"))
        .collect();

    let first_ctx = creds[0].get_ctx().unwrap();
    for c in &creds {
        assert!(Arc::ptr_eq(&c.get_ctx().unwrap(), &first_ctx));
    }
    assert_eq!(upcalls.load(Ordering::SeqCst), 1, "64 concurrent callers must dedup to one upcall");
}

/// S5: an integrity-protected call marshals, gets validated by a
/// simulated server (MIC verified against the same context), and a
/// privacy-wrapped request/response round-trips through wrap_req/unwrap_resp.
#[tokio::test]
async fn s5_wrap_req_unwrap_resp_round_trip_for_each_service() {
    for service in [SecurityService::Integrity, SecurityService::Privacy] {
        let registry = Arc::new(DaemonRegistry::new());
        let mechanism = Mechanism::new("krb5", "aes256-cts");
        let provider = Arc::new(LoopbackMechanism::new());
        let (auth, _ep0, ep1) = new_authenticator(mechanism, service, provider, registry, fast_config());
        let auth = Arc::new(auth);
        tokio::spawn(run_v1_daemon(auth.clone(), ep1, |uid, _mech| Downcall {
            uid,
            timeout_secs: 3600,
            window: 128,
            outcome: DowncallOutcome::Success {
                wire_ctx: b"CC".to_vec(),
                sec_blob: vec![7, 7, 7],
            },
        }));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let req = AuthCredRequest {
            uid: 5000,
            principal: None,
            machine_cred: false,
        };
        let cancel = CancellationToken::new();
        let cred = auth.get_credential(&req, &cancel).await.unwrap();

        let mut buf = gss_client::testing::InMemoryXdrBuffer::with_xid(7);
        let seqno = auth.marshal(&cred, &mut buf).unwrap();

        let payload: u32 = 0xDEAD_BEEF;
        let wrap_start = buf.position();
        auth.wrap_req(&cred, gss_client::GssProc::Data, seqno, &mut buf, &mut |b| {
            b.write_u32(payload);
            Ok(())
        })
        .unwrap();

        // Simulate the wrapped body arriving back over the wire as a reply:
        // hand `unwrap_resp` a fresh buffer over just the bytes `wrap_req`
        // produced, cursor at the start, rather than reusing `buf`'s own
        // (already-advanced) cursor.
        let wrapped_frame = buf.as_slice()[wrap_start..].to_vec();
        let mut reply_buf = gss_client::testing::InMemoryXdrBuffer::from_bytes(wrapped_frame);

        let mut decoded = 0u32;
        auth.unwrap_resp(&cred, gss_client::GssProc::Data, seqno, &mut reply_buf, &mut |b| {
            decoded = b.read_u32()?;
            Ok(())
        })
        .unwrap();
        assert_eq!(decoded, payload, "round trip must preserve the payload under {service:?}");
    }
}

/// S6: the v0 and v1 pipes share one process-wide version latch, so a
/// daemon that opens v0 first blocks a second daemon from opening v1.
#[tokio::test]
async fn s6_pipe_version_latch_rejects_the_second_daemon() {
    let (auth, mut ep0, mut ep1) = build(fast_config());
    assert!(ep0.open_daemon());
    assert!(!ep1.open_daemon(), "v1 must be refused while v0 holds the latch");

    ep0.release_daemon(&auth.pipe_v0);
    assert!(ep1.open_daemon(), "v1 may open once v0 releases the latch");
}
