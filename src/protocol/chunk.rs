//! Reference-counted body chunk handles.
//!
//! A [`ChunkBuf`] wraps one contiguous range of body bytes as produced by the
//! request decoder. The underlying storage is shared (`bytes::Bytes`), so a
//! handle is cheap to move around; payload bytes are never copied by the body
//! intake machinery. Every handle ends its life in exactly one of three ways:
//! it is released, it is retained inside a composed body buffer, or its bytes
//! are handed off to the consumer via [`ChunkBuf::into_bytes`].
//!
//! The [`audit`] counters record those three outcomes so tests can assert
//! that no handle is leaked or double-released. Counting is active in debug
//! builds only.

use bytes::Bytes;

/// A handle over one chunk of request body bytes.
///
/// Dropping the handle releases it. [`ChunkBuf::release`] exists to make the
/// release site explicit at the call sites that own the decision.
#[derive(Debug)]
pub struct ChunkBuf {
    data: Option<Bytes>,
}

impl ChunkBuf {
    pub fn new(data: Bytes) -> Self {
        audit::created();
        Self { data: Some(data) }
    }

    pub fn from_static(data: &'static [u8]) -> Self {
        Self::new(Bytes::from_static(data))
    }

    /// Number of readable payload bytes carried by this handle.
    pub fn readable_bytes(&self) -> usize {
        self.data.as_ref().map_or(0, Bytes::len)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    /// Returns a shared view of the underlying storage without giving up the
    /// handle.
    pub fn bytes(&self) -> Bytes {
        self.data.clone().unwrap_or_default()
    }

    /// Hands the underlying storage off to the caller. The caller becomes
    /// responsible for the bytes; the handle itself is consumed and no longer
    /// counts as held.
    pub fn into_bytes(mut self) -> Bytes {
        audit::transferred();
        self.data.take().unwrap_or_default()
    }

    /// Releases the handle. Equivalent to dropping it; spelled out where the
    /// ownership rules demand an explicit release site.
    pub fn release(self) {}
}

impl Drop for ChunkBuf {
    fn drop(&mut self) {
        if self.data.take().is_some() {
            audit::released();
        }
    }
}

impl From<Bytes> for ChunkBuf {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

/// Debug-build bookkeeping of chunk handle ownership.
///
/// `created == released + transferred` must hold once a request is fully
/// torn down; a positive [`Counters::live`] value at that point is a leak.
pub mod audit {
    use std::cell::Cell;

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Counters {
        pub created: u64,
        pub released: u64,
        pub transferred: u64,
    }

    impl Counters {
        /// Handles created but neither released nor handed off yet.
        pub fn live(&self) -> u64 {
            self.created - self.released - self.transferred
        }
    }

    thread_local! {
        static COUNTERS: Cell<Counters> = const { Cell::new(Counters {
            created: 0,
            released: 0,
            transferred: 0,
        }) };
    }

    fn bump(f: impl FnOnce(&mut Counters)) {
        if cfg!(debug_assertions) {
            COUNTERS.with(|c| {
                let mut counters = c.get();
                f(&mut counters);
                c.set(counters);
            });
        }
    }

    pub(crate) fn created() {
        bump(|c| c.created += 1);
    }

    pub(crate) fn released() {
        bump(|c| c.released += 1);
    }

    pub(crate) fn transferred() {
        bump(|c| c.transferred += 1);
    }

    /// Current counters for the calling thread. All zero in release builds.
    pub fn counters() -> Counters {
        COUNTERS.with(Cell::get)
    }

    /// Resets the calling thread's counters. Intended for test setup.
    pub fn reset() {
        COUNTERS.with(|c| c.set(Counters::default()));
    }
}
