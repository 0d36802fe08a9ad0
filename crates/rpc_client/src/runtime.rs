//! Host RPC runtime seams.
//!
//! The ONC RPC transport/scheduler (task queues, XDR buffer management,
//! retries) lives outside this crate. To make [`crate::auth::Authenticator`]
//! and the upcall coordinator compilable and testable without a full RPC
//! stack, this module names the two seams a real host runtime would plug
//! into: an RPC task identity ([`RpcTask`]) and a scatter-gather XDR buffer
//! ([`XdrBuffer`]). [`crate::testing::TestRpcTask`] /
//! [`crate::testing::InMemoryXdrBuffer`] are the tests-only implementations
//! that make the round-trip and concurrency property tests executable end
//! to end.

use std::ops::Range;
use std::sync::Arc;

use crate::credential::Credential;
use crate::error::{GssAuthError, Result};

/// An RPC task bound to one credential, as `refresh` sees it: never blocks
/// the caller, registers the rebind/park/complete operations the real
/// scheduler would drive.
pub trait RpcTask: Send + Sync {
    /// The credential this task is currently bound to.
    fn cred(&self) -> Arc<Credential>;
    /// Rebinds the task to a different credential: swap the task's
    /// credential pointer rather than mutating an existing Credential's
    /// context in place.
    fn set_cred(&self, cred: Arc<Credential>);
    /// Parks the task on the global "waiting for any daemon" queue,
    /// standing in for the real scheduler re-driving the task once a pipe
    /// attaches.
    fn park_on_version_wait(&self);
    /// Completes the task with a terminal error.
    fn complete_with_error(&self, err: GssAuthError);
    /// Completes the task successfully (used by tests to observe the
    /// refresh path's async completion callback running).
    fn complete_ok(&self);
}

/// A scatter-gather, page-aware XDR buffer, as `marshal`/`validate`/
/// `wrap_req`/`unwrap_resp` see it. All positions are byte offsets from the
/// start of the buffer.
pub trait XdrBuffer: Send {
    fn position(&self) -> usize;
    fn set_position(&mut self, pos: usize);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes `bytes` at the current position, extending the buffer if
    /// necessary, and advances the position past them.
    fn write_bytes(&mut self, bytes: &[u8]);
    /// Reads `len` bytes from the current position, advancing past them.
    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>>;
    /// Borrows an already-written byte range without moving the cursor.
    fn slice(&self, range: Range<usize>) -> &[u8];

    /// Offset of the 4-byte RPC call XID from the start of this buffer.
    /// `marshal`'s MIC covers `[xid_offset .. end of credential block]`.
    fn xid_offset(&self) -> usize;

    /// Duplicates the tail starting at `start` onto its own freshly
    /// allocated region, so a `wrap` call's in-place output has head-room,
    /// backed by the `GSS_CRED_SLACK` scratch reservation (see
    /// `crate::auth`).
    fn duplicate_tail_for_wrap(&mut self, start: usize) -> Vec<u8>;
    /// Replaces everything from `start` onward with `data` (the now-wrapped
    /// bytes), repositioning the cursor to the new end.
    fn replace_tail(&mut self, start: usize, data: &[u8]);

    /// Builds a fresh buffer of the same concrete kind over `bytes`, cursor
    /// at the start. `unwrap_resp` needs this to hand the unwrapped/verified
    /// payload to the caller's `decode` closure as a plain
    /// `&mut dyn XdrBuffer` without this crate depending on any one host
    /// runtime's buffer type.
    fn new_sub_buffer(&self, bytes: Vec<u8>) -> Box<dyn XdrBuffer>;

    /// Writes a big-endian `u32`. The RPC wire is always network byte
    /// order, unlike the host-endian pipe protocol.
    fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_be_bytes());
    }

    /// Reads a big-endian `u32`.
    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("read_bytes(4) returns 4 bytes")))
    }

    /// Writes a `netobj`: big-endian length prefix then the bytes.
    fn write_netobj(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    /// Reads a `netobj`, rejecting a claimed length over `max_len`.
    fn read_netobj(&mut self, max_len: usize) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        if len > max_len {
            return Err(GssAuthError::Decode(gss_io::IoError::length_overrun(
                len,
                max_len,
                "netobj",
            )));
        }
        self.read_bytes(len)
    }

    /// Overwrites a previously-written `u32` at `offset`, used to
    /// back-fill length placeholders once the real value is known.
    fn backfill_u32(&mut self, offset: usize, value: u32) {
        let saved = self.position();
        self.set_position(offset);
        self.write_bytes(&value.to_be_bytes());
        self.set_position(saved.max(offset + 4));
    }

    /// Pads the buffer with zero bytes up to the next multiple of `align`,
    /// matching `gss_io::BinaryWriter::pad_to`.
    fn pad_to(&mut self, align: usize) {
        let rem = self.len() % align;
        if rem != 0 {
            let pad = vec![0u8; align - rem];
            let saved = self.position();
            self.set_position(self.len());
            self.write_bytes(&pad);
            self.set_position(saved);
        }
    }
}
