//! Client-side RPCSEC_GSS authentication for an ONC RPC runtime.
//!
//! Acquires per-user security contexts from a local user-space daemon over
//! a named-pipe-style channel, binds them to RPC credentials, and stamps
//! each outbound call with a cryptographic verifier and (optionally)
//! integrity/privacy wrapping of the argument body.
//!
//! Five components:
//! - [`mechanism`]: the opaque GSS mechanism provider interface
//! - [`pipe`]: the bidirectional upcall/downcall channel and its
//!   process-wide version latch
//! - [`upcall`]: de-duplicated per-uid upcall coordination
//! - [`credential`]: the credential cache and the shared, swappable
//!   security [`credential::Context`]
//! - [`auth`]: the per-mount [`auth::Authenticator`]: marshal, validate,
//!   wrap_req, unwrap_resp, refresh
//!
//! [`runtime`] names the two seams a host RPC runtime plugs into
//! (`RpcTask`, `XdrBuffer`); [`testing`] provides self-contained stand-ins
//! for both plus a deterministic mechanism provider, used by this crate's
//! own tests and available to downstream crates under the `testing`
//! feature.

pub mod auth;
pub mod credential;
pub mod error;
pub mod mechanism;
pub mod pipe;
pub mod runtime;
pub mod upcall;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use auth::Authenticator;
pub use credential::{AuthCredRequest, CredCache, Context, Credential, CredFlags, GssProc};
pub use error::{GssAuthError, Result};
pub use mechanism::{MechanismId, MechanismProvider, Mechanism, PseudoFlavorTable, SecurityService};
pub use pipe::{DaemonRegistry, PipeChannel, PipeEndpoint, PipeVersion};
pub use runtime::{RpcTask, XdrBuffer};
pub use upcall::UpcallCoordinator;

use std::sync::Arc;

use gss_config::GssConfig;

/// Builds a fully-wired [`Authenticator`] for one mechanism: both pipe
/// versions sharing one [`DaemonRegistry`], and the upcall coordinator
/// that drives them. This is the construction path a host RPC client
/// would call once per mount.
pub fn new_authenticator(
    mechanism: Mechanism,
    service: SecurityService,
    provider: Arc<dyn MechanismProvider>,
    registry: Arc<DaemonRegistry>,
    config: GssConfig,
) -> (Authenticator, PipeEndpoint, PipeEndpoint) {
    let mechanism = Arc::new(mechanism);
    let (pipe_v0, endpoint_v0) =
        pipe::channel_pair(PipeVersion::V0, mechanism.name(), registry.clone());
    let (pipe_v1, endpoint_v1) =
        pipe::channel_pair(PipeVersion::V1, mechanism.name(), registry.clone());
    let coordinator = Arc::new(UpcallCoordinator::new(
        registry,
        mechanism.clone(),
        provider.clone(),
        config.clone(),
    ));
    let authenticator = Authenticator {
        mechanism,
        service,
        pipe_v0,
        pipe_v1,
        coordinator,
        cred_cache: CredCache::new(),
        config,
        provider,
    };
    (authenticator, endpoint_v0, endpoint_v1)
}
