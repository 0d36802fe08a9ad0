//! Mechanism provider interface.
//!
//! The GSS mechanism itself (Kerberos 5 token generation, MIC computation,
//! wrap/unwrap) is an external collaborator; this module defines only the
//! capability set the core consumes: an opaque handle, a
//! MIC/verify/wrap/unwrap/import/delete surface, and the pseudo-flavor
//! lookup table. A concrete provider (backed by a real krb5 library) plugs
//! in by implementing [`MechanismProvider`]; see [`crate::testing::LoopbackMechanism`]
//! for a self-contained stand-in used by this crate's own tests.

use std::collections::HashMap;
use thiserror::Error;

/// The RPC auth-flavor security service an authenticator applies to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityService {
    None = 1,
    Integrity = 2,
    Privacy = 3,
}

/// Identifies a GSS mechanism (e.g. `"krb5"`) independent of which
/// [`SecurityService`] a particular pseudo-flavor requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MechanismId(pub String);

impl MechanismId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

/// An immutable GSS mechanism handle: a name, the upcall enctype string the
/// daemon needs to pick a key, and nothing else
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub id: MechanismId,
    /// e.g. `"aes256-cts"`, forwarded to the daemon in the v1 upcall line.
    pub upcall_enctype: String,
}

impl Mechanism {
    pub fn new(name: impl Into<String>, upcall_enctype: impl Into<String>) -> Self {
        Self {
            id: MechanismId::new(name),
            upcall_enctype: upcall_enctype.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.id.0
    }
}

/// Maps an RPC pseudo-flavor integer to the (mechanism, service) pair it
/// encodes. A real mechanism provider supports more than one flavor per
/// mechanism (e.g. krb5, krb5i, krb5p).
#[derive(Debug, Default)]
pub struct PseudoFlavorTable {
    entries: HashMap<u32, (MechanismId, SecurityService)>,
}

impl PseudoFlavorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pseudo_flavor: u32, mechanism: MechanismId, service: SecurityService) {
        self.entries.insert(pseudo_flavor, (mechanism, service));
    }

    pub fn lookup(&self, pseudo_flavor: u32) -> Option<(&MechanismId, SecurityService)> {
        self.entries
            .get(&pseudo_flavor)
            .map(|(m, s)| (m, *s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One mechanism can register more than one pseudo-flavor, one per
    /// security service.
    #[test]
    fn table_distinguishes_pseudo_flavors_of_the_same_mechanism() {
        let mut table = PseudoFlavorTable::new();
        let krb5 = MechanismId::new("krb5");
        table.register(390003, krb5.clone(), SecurityService::None);
        table.register(390004, krb5.clone(), SecurityService::Integrity);
        table.register(390005, krb5.clone(), SecurityService::Privacy);

        assert_eq!(table.lookup(390003), Some((&krb5, SecurityService::None)));
        assert_eq!(table.lookup(390004), Some((&krb5, SecurityService::Integrity)));
        assert_eq!(table.lookup(390005), Some((&krb5, SecurityService::Privacy)));
        assert_eq!(table.lookup(1), None);
    }
}

/// Errors a mechanism provider can raise for reasons other than context
/// expiry, grounded on the teacher's `neo-cryptography` `Error` enum shape
/// (`InvalidFormat`, `InvalidKey`, `VerificationFailed`, `UnsupportedAlgorithm`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MechError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid or corrupt key material: {0}")]
    InvalidKey(String),

    #[error("MIC/signature verification failed")]
    VerificationFailed,

    #[error("unsupported mechanism or enctype: {0}")]
    UnsupportedAlgorithm(String),

    #[error("internal provider error: {0}")]
    Internal(String),
}

/// Outcome of a MIC/wrap/unwrap call, collapsing the provider's response
/// into exactly three cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MechResult<T> {
    Complete(T),
    /// The core treats this as "clear `UPTODATE`, let renewal take over",
    /// never a hard failure of the in-flight call.
    ContextExpired,
    Failure(MechError),
}

impl<T> MechResult<T> {
    pub fn is_context_expired(&self) -> bool {
        matches!(self, MechResult::ContextExpired)
    }
}

/// An imported, live GSS context handle as the provider sees it. Opaque to
/// the rest of this crate beyond being passed back into the provider.
///
/// `as_any` exists solely so a concrete [`MechanismProvider`] can downcast
/// the handles it itself hands out (e.g. the loopback test provider
/// recovering its shared key); the core never downcasts a handle.
pub trait MechContextHandle: Send + Sync + std::fmt::Debug {
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Capability set the core consumes from a GSS mechanism implementation.
///
/// All operations are synchronous and non-sleeping:
/// `marshal`/`validate`/`wrap_req`/`unwrap_resp` run on the transport's
/// send/receive path and must never block.
pub trait MechanismProvider: Send + Sync {
    /// Imports a serialized context blob received from the daemon's
    /// downcall into a live handle.
    fn import_sec_context(
        &self,
        mechanism: &Mechanism,
        serialized: &[u8],
    ) -> MechResult<Box<dyn MechContextHandle>>;

    /// Computes a MIC (integrity tag) over `data`.
    fn get_mic(&self, ctx: &dyn MechContextHandle, data: &[u8]) -> MechResult<Vec<u8>>;

    /// Verifies a MIC over `data`.
    fn verify_mic(&self, ctx: &dyn MechContextHandle, data: &[u8], mic: &[u8]) -> MechResult<()>;

    /// Wraps (optionally encrypting) `data` in place, per `service`.
    fn wrap(
        &self,
        ctx: &dyn MechContextHandle,
        data: &[u8],
        confidential: bool,
    ) -> MechResult<Vec<u8>>;

    /// Inverse of [`MechanismProvider::wrap`].
    fn unwrap(
        &self,
        ctx: &dyn MechContextHandle,
        wrapped: &[u8],
        confidential: bool,
    ) -> MechResult<Vec<u8>>;

    /// Releases a context handle.
    fn delete_sec_context(&self, ctx: Box<dyn MechContextHandle>);
}
