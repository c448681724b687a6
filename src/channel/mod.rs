//! The transport seam consumed by the body intake layer.
//!
//! The network side of a connection is driven elsewhere; the body machinery
//! only needs four operations from it: pull one more chunk, write the
//! `100 Continue` preface, signal downstream that an expected body was
//! refused, and report why the peer went away. [`Channel`] captures exactly
//! that surface so the intake core stays independent of the socket and
//! framing code.
//!
//! All methods are invoked from the connection's own executor; a channel
//! implementation must not block.

use std::io;

/// The continue preface inviting the client to transmit the body when
/// `Expect: 100-continue` is present.
pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// Completion callback for [`Channel::write_continue`].
pub type WriteCallback = Box<dyn FnOnce(io::Result<()>)>;

/// Handle to the transport for one connection.
pub trait Channel {
    /// Requests one more chunk from the transport. The chunk (or close
    /// notification) is delivered later through the accumulator.
    fn read(&self);

    /// Writes [`CONTINUE_RESPONSE`] and invokes `on_done` with the write
    /// outcome once the bytes are flushed.
    fn write_continue(&self, on_done: WriteCallback);

    /// Signals the connection pipeline that the advertised body was refused,
    /// so downstream can reject it instead of waiting for bytes.
    fn fire_expectation_failed(&self);

    /// Closure reason reported by the transport, if it is already known.
    fn closure_reason(&self) -> Option<String> {
        None
    }
}
