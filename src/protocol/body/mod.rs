//! Request body intake.
//!
//! The subsystem that owns the inbound body of one request: accumulation of
//! decoder chunk events, size-ceiling enforcement, `100-continue` handling,
//! and the three ways the application can consume the body (buffered read,
//! flow-controlled stream, drain).

mod body_buf;
mod body_stream;
mod req_body;

pub use body_buf::BodyBuf;
pub use body_stream::BodyStream;
pub use req_body::{DrainOutcome, OnTooLarge, RequestBody};
