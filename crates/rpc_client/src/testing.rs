//! Self-contained test doubles: a deterministic [`MechanismProvider`]
//! ("loopback" mechanism, standing in for a real Kerberos library) and an
//! in-memory [`XdrBuffer`]/[`RpcTask`] pair so the round-trip and
//! concurrency property tests are executable end to end without a host
//! RPC stack. Always available to this crate's own tests; exposed to
//! downstream crates only under the `testing` feature.
//!
//! The GSS mechanism and the ONC RPC transport/scheduler are both external
//! collaborators of this crate, so this kind of stand-in is what makes the
//! wire protocol testable in isolation.

use std::ops::Range;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;

use crate::credential::Credential;
use crate::error::{GssAuthError, Result};
use crate::mechanism::{MechContextHandle, MechError, MechResult, Mechanism, MechanismProvider};
use crate::runtime::{RpcTask, XdrBuffer};
use gss_io::IoError;

type HmacSha256 = Hmac<Sha256>;

/// An imported loopback context handle: just the shared key.
#[derive(Debug)]
struct LoopbackHandle {
    key: Vec<u8>,
}

impl MechContextHandle for LoopbackHandle {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A deterministic mechanism provider used only under `#[cfg(test)]` / the
/// `testing` feature. Computes an HMAC-SHA256 MIC and an XOR-stream "wrap",
/// not real GSS cryptography, but enough to exercise marshal/validate and
/// wrap_req/unwrap_resp end to end.
pub struct LoopbackMechanism {
    /// Serialized context blobs this provider is willing to import map to
    /// this fixed key, so the same blob always imports to the same
    /// behaviour across a test run.
    fixed_key: Vec<u8>,
    fail_import: bool,
}

impl Default for LoopbackMechanism {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMechanism {
    pub fn new() -> Self {
        Self {
            fixed_key: b"loopback-test-key-0123456789abcdef".to_vec(),
            fail_import: false,
        }
    }

    /// A provider that always fails `import_sec_context`, for exercising
    /// the retry/EAGAIN collapse path on a daemon that can never complete
    /// an import.
    pub fn failing_import() -> Self {
        Self {
            fixed_key: Vec::new(),
            fail_import: true,
        }
    }

    /// Builds a handle directly, bypassing the upcall/import path, for
    /// tests that only need a live Context.
    pub fn new_handle_for_test(&self) -> Box<dyn MechContextHandle> {
        Box::new(LoopbackHandle {
            key: self.fixed_key.clone(),
        })
    }

    fn mic(key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn xor_stream(key: &[u8], data: &[u8]) -> Vec<u8> {
        data.iter()
            .enumerate()
            .map(|(i, b)| b ^ key[i % key.len()])
            .collect()
    }
}

impl MechanismProvider for LoopbackMechanism {
    fn import_sec_context(
        &self,
        _mechanism: &Mechanism,
        serialized: &[u8],
    ) -> MechResult<Box<dyn MechContextHandle>> {
        if self.fail_import {
            return MechResult::Failure(MechError::InvalidFormat(
                "loopback provider configured to fail import".into(),
            ));
        }
        if serialized.is_empty() {
            return MechResult::Failure(MechError::InvalidFormat("empty sec_blob".into()));
        }
        MechResult::Complete(Box::new(LoopbackHandle {
            key: self.fixed_key.clone(),
        }))
    }

    fn get_mic(&self, ctx: &dyn MechContextHandle, data: &[u8]) -> MechResult<Vec<u8>> {
        let key = &as_loopback(ctx).key;
        MechResult::Complete(Self::mic(key, data))
    }

    fn verify_mic(&self, ctx: &dyn MechContextHandle, data: &[u8], mic: &[u8]) -> MechResult<()> {
        let key = &as_loopback(ctx).key;
        if Self::mic(key, data) == mic {
            MechResult::Complete(())
        } else {
            MechResult::Failure(MechError::VerificationFailed)
        }
    }

    fn wrap(&self, ctx: &dyn MechContextHandle, data: &[u8], confidential: bool) -> MechResult<Vec<u8>> {
        let key = &as_loopback(ctx).key;
        if confidential {
            MechResult::Complete(Self::xor_stream(key, data))
        } else {
            MechResult::Complete(data.to_vec())
        }
    }

    fn unwrap(&self, ctx: &dyn MechContextHandle, wrapped: &[u8], confidential: bool) -> MechResult<Vec<u8>> {
        // XOR is its own inverse.
        self.wrap(ctx, wrapped, confidential)
    }

    fn delete_sec_context(&self, _ctx: Box<dyn MechContextHandle>) {}
}

fn as_loopback(ctx: &dyn MechContextHandle) -> &LoopbackHandle {
    ctx.as_any()
        .downcast_ref::<LoopbackHandle>()
        .expect("loopback provider only ever hands out LoopbackHandle")
}

/// An in-memory, growable buffer implementing [`XdrBuffer`] by direct
/// cursor manipulation over a `Vec<u8>`, the tests-only stand-in for the
/// host RPC runtime's real XDR buffer.
pub struct InMemoryXdrBuffer {
    data: Vec<u8>,
    position: usize,
    xid_offset: usize,
}

impl InMemoryXdrBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            position: 0,
            xid_offset: 0,
        }
    }

    /// Starts the buffer with a 4-byte XID already written, as a real RPC
    /// call buffer would have before the credential block is appended.
    pub fn with_xid(xid: u32) -> Self {
        let mut buf = Self::new();
        buf.write_bytes(&xid.to_be_bytes());
        buf
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            position: 0,
            xid_offset: 0,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Default for InMemoryXdrBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl XdrBuffer for InMemoryXdrBuffer {
    fn position(&self) -> usize {
        self.position
    }

    fn set_position(&mut self, pos: usize) {
        self.position = pos;
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        if self.position + len > self.data.len() {
            return Err(GssAuthError::Decode(IoError::end_of_stream(
                self.position + len - self.data.len(),
                "xdr buffer",
            )));
        }
        let out = self.data[self.position..self.position + len].to_vec();
        self.position += len;
        Ok(out)
    }

    fn slice(&self, range: Range<usize>) -> &[u8] {
        &self.data[range]
    }

    fn xid_offset(&self) -> usize {
        self.xid_offset
    }

    fn duplicate_tail_for_wrap(&mut self, start: usize) -> Vec<u8> {
        self.data[start..].to_vec()
    }

    fn replace_tail(&mut self, start: usize, data: &[u8]) {
        self.data.truncate(start);
        self.data.extend_from_slice(data);
        self.position = self.data.len();
    }

    fn new_sub_buffer(&self, bytes: Vec<u8>) -> Box<dyn XdrBuffer> {
        Box::new(InMemoryXdrBuffer::from_bytes(bytes))
    }
}

/// A tests-only [`RpcTask`]: records whether it parked or completed, and
/// lets the test assert on the final credential/error.
pub struct TestRpcTask {
    cred: Mutex<Arc<Credential>>,
    parked: Mutex<bool>,
    result: Mutex<Option<std::result::Result<(), GssAuthError>>>,
}

impl TestRpcTask {
    pub fn new(cred: Arc<Credential>) -> Arc<Self> {
        Arc::new(Self {
            cred: Mutex::new(cred),
            parked: Mutex::new(false),
            result: Mutex::new(None),
        })
    }

    pub fn current_cred(&self) -> Arc<Credential> {
        self.cred.lock().clone()
    }

    pub fn was_parked(&self) -> bool {
        *self.parked.lock()
    }

    pub fn result(&self) -> Option<std::result::Result<(), GssAuthError>> {
        self.result.lock().clone()
    }
}

impl RpcTask for TestRpcTask {
    fn cred(&self) -> Arc<Credential> {
        self.cred.lock().clone()
    }

    fn set_cred(&self, cred: Arc<Credential>) {
        *self.cred.lock() = cred;
    }

    fn park_on_version_wait(&self) {
        *self.parked.lock() = true;
    }

    fn complete_with_error(&self, err: GssAuthError) {
        *self.result.lock() = Some(Err(err));
    }

    fn complete_ok(&self) {
        *self.result.lock() = Some(Ok(()));
    }
}
