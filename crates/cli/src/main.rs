//! Demo harness for the RPCSEC_GSS client: wires an [`Authenticator`] up to
//! an in-process loopback daemon (the `testing::LoopbackMechanism` stand-in
//! for a real Kerberos library plus a hand-rolled responder task standing in
//! for `rpc.gssd`) and drives one cold credential acquisition through
//! marshal/wrap_req/unwrap_resp end to end against a cold credential cache.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gss_client::credential::AuthCredRequest;
use gss_client::pipe::{decode_upcall_v1, encode_downcall, DaemonRegistry, Downcall, DowncallOutcome};
use gss_client::testing::{InMemoryXdrBuffer, LoopbackMechanism};
use gss_client::{new_authenticator, GssProc, Mechanism, SecurityService, XdrBuffer};
use gss_config::GssConfig;

#[derive(Parser, Debug)]
#[command(
    name = "gss-cli",
    version,
    about = "Drive an RPCSEC_GSS client against an in-process loopback daemon"
)]
struct Cli {
    /// uid to request a credential for.
    #[arg(long, default_value_t = 1000)]
    uid: u32,

    /// Security service to apply to the demo call.
    #[arg(long, value_enum, default_value = "integrity")]
    service: ServiceArg,

    /// Logging verbosity, overridden by `RUST_LOG` if set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ServiceArg {
    None,
    Integrity,
    Privacy,
}

impl From<ServiceArg> for SecurityService {
    fn from(value: ServiceArg) -> Self {
        match value {
            ServiceArg::None => SecurityService::None,
            ServiceArg::Integrity => SecurityService::Integrity,
            ServiceArg::Privacy => SecurityService::Privacy,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let service: SecurityService = cli.service.into();
    let registry = Arc::new(DaemonRegistry::new());
    let mechanism = Mechanism::new("krb5", "aes256-cts");
    let provider = Arc::new(LoopbackMechanism::new());
    let (authenticator, _pipe_v0_endpoint, pipe_v1_endpoint) =
        new_authenticator(mechanism, service, provider, registry, GssConfig::default());
    let authenticator = Arc::new(authenticator);

    tokio::spawn(run_loopback_daemon(authenticator.clone(), pipe_v1_endpoint));

    let req = AuthCredRequest {
        uid: cli.uid,
        principal: None,
        machine_cred: false,
    };
    let cancel = CancellationToken::new();

    let cred = authenticator
        .get_credential(&req, &cancel)
        .await
        .context("cold credential acquisition failed")?;
    info!(uid = cred.uid, service = ?service, "credential established");

    let mut buf = InMemoryXdrBuffer::with_xid(1);
    let seqno = authenticator.marshal(&cred, &mut buf).context("marshal failed")?;
    info!(seqno, "marshalled RPCSEC_GSS credential block");

    let payload: u32 = 0x1234_5678;
    let wrap_start = buf.position();
    authenticator
        .wrap_req(&cred, GssProc::Data, seqno, &mut buf, &mut |b| {
            b.write_u32(payload);
            Ok(())
        })
        .context("wrap_req failed")?;

    // Stand in for the wrapped body coming back over the wire as a reply:
    // a fresh buffer over just the bytes `wrap_req` produced, cursor at 0.
    let wrapped_frame = buf.as_slice()[wrap_start..].to_vec();
    let mut reply_buf = InMemoryXdrBuffer::from_bytes(wrapped_frame);

    let mut echoed = 0u32;
    authenticator
        .unwrap_resp(&cred, GssProc::Data, seqno, &mut reply_buf, &mut |b| {
            echoed = b.read_u32()?;
            Ok(())
        })
        .context("unwrap_resp failed")?;

    info!(sent = format_args!("0x{payload:08x}"), received = format_args!("0x{echoed:08x}"), "round trip complete");
    Ok(())
}

/// The daemon side of the demo: reads v1 upcall lines and answers every one
/// with a fixed, always-succeeding downcall. A real `rpc.gssd` would run
/// actual Kerberos key exchange here; this harness only exists to exercise
/// the wire protocol end to end without one.
async fn run_loopback_daemon(
    authenticator: Arc<gss_client::Authenticator>,
    mut endpoint: gss_client::PipeEndpoint,
) {
    if !endpoint.open_daemon() {
        tracing::warn!("loopback daemon could not attach: pipe version already latched");
        return;
    }
    while let Some(bytes) = endpoint.recv_upcall().await {
        let (uid, mechanism) = match decode_upcall_v1(&bytes, authenticator.config.upcall_line_max_bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed upcall line");
                continue;
            }
        };
        tracing::debug!(uid, mechanism, "loopback daemon answering upcall");
        let downcall = Downcall {
            uid,
            timeout_secs: 3600,
            window: 128,
            outcome: DowncallOutcome::Success {
                wire_ctx: format!("ctx-for-{uid}").into_bytes(),
                sec_blob: vec![0xAA; 16],
            },
        };
        let encoded = encode_downcall(&downcall);
        if let Err(err) = endpoint
            .write_downcall(&authenticator.pipe_v1, authenticator.coordinator.as_ref(), &encoded)
            .await
        {
            tracing::warn!(%err, "failed to deliver downcall");
        }
        // Give the resolved waiter a tick before looking for the next upcall,
        // purely so demo log lines interleave readably.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
