//! Request body intake for an event-driven HTTP/1.1 server.
//!
//! The crate sits between the connection's decoder, which delivers parsed
//! body chunks, and application handlers, which consume the body at a time
//! of their choosing. [`protocol::RequestBody`] owns the chunks for one
//! request, enforces the configured size ceiling, honors
//! `Expect: 100-continue`, and exposes the body exactly once, either as one
//! composed buffer, as a flow-controlled chunk stream, or by draining it so
//! the connection can be reused.
//!
//! The transport and the per-request scheduler are consumed through the
//! seams in [`channel`] and [`exec`].

pub mod channel;
pub mod exec;
pub mod protocol;
