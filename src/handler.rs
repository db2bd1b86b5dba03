//! The two traits the connection engine calls out to: `Handler` for
//! application message dispatch and `Cipher` for an optional in-place
//! payload transform.

use crate::conn::{CloseCause, Conn};

/// In-place payload transform applied after decode (decrypt) and before
/// framing (encrypt). Implementations must not change the payload length.
pub trait Cipher: Send {
    fn encrypt_in_place(&mut self, buf: &mut [u8]);
    fn decrypt_in_place(&mut self, buf: &mut [u8]);
}

/// Application callbacks, invoked on the owning shard's event-loop thread.
///
/// `on_message`'s return value is an ordering hint, not a buffer-ownership
/// signal: `true` tells the engine the handler may finish processing this
/// message asynchronously, so the handler is responsible for its own
/// cross-message ordering. `payload` is always a short-lived, already-owned
/// buffer decoded fresh for this call (never a view into the RX
/// accumulator), regardless of the return value.
pub trait Handler: Send + Sync {
    fn on_open(&self, conn: &Conn);
    fn on_message(&self, conn: &Conn, api: u16, payload: &[u8]) -> bool;
    fn on_close(&self, conn: &Conn, reason: &CloseCause);
}
