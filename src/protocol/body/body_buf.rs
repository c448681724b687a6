//! Composed body buffers delivered by the one-shot reader.
//!
//! A [`BodyBuf`] logically concatenates the chunk handles accumulated for a
//! request without copying payload bytes. The buffer owns the release of
//! every chunk it was composed from; release happens at the first of:
//! an explicit [`BodyBuf::release`], the handle being dropped, or the
//! request execution completing (the reader registers a completion hook for
//! callers that forget).

use std::cell::RefCell;
use std::rc::Rc;

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::chunk::ChunkBuf;

pub(crate) enum Segments {
    Empty,
    Single(ChunkBuf),
    Multi(Vec<ChunkBuf>),
}

impl Segments {
    fn readable_bytes(&self) -> usize {
        match self {
            Segments::Empty => 0,
            Segments::Single(chunk) => chunk.readable_bytes(),
            Segments::Multi(chunks) => chunks.iter().map(ChunkBuf::readable_bytes).sum(),
        }
    }
}

pub(crate) type BufSlot = Rc<RefCell<Option<Segments>>>;

/// A fully received request body.
///
/// Single-chunk bodies are zero-copy views of the received chunk;
/// multi-chunk bodies stay segmented until the caller asks for a contiguous
/// [`BodyBuf::to_bytes`].
pub struct BodyBuf {
    slot: BufSlot,
}

impl BodyBuf {
    pub(crate) fn empty() -> Self {
        Self { slot: Rc::new(RefCell::new(Some(Segments::Empty))) }
    }

    pub(crate) fn single(chunk: ChunkBuf) -> Self {
        Self { slot: Rc::new(RefCell::new(Some(Segments::Single(chunk)))) }
    }

    pub(crate) fn multi(chunks: Vec<ChunkBuf>) -> Self {
        Self { slot: Rc::new(RefCell::new(Some(Segments::Multi(chunks)))) }
    }

    /// Builds a buffer from the chunks received so far, draining `received`.
    pub(crate) fn compose(received: &mut Vec<ChunkBuf>) -> Self {
        match received.len() {
            0 => Self::empty(),
            1 => Self::single(received.remove(0)),
            _ => Self::multi(received.drain(..).collect()),
        }
    }

    pub(crate) fn slot_handle(&self) -> BufSlot {
        self.slot.clone()
    }

    /// Releases the slot's contents if they are still held. Used by the
    /// execution completion hook.
    pub(crate) fn release_slot(slot: &BufSlot) {
        let _ = slot.borrow_mut().take();
    }

    /// Total number of readable payload bytes. Zero after release.
    pub fn readable_bytes(&self) -> usize {
        self.slot.borrow().as_ref().map_or(0, Segments::readable_bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// True once the underlying chunks have been released.
    pub fn is_released(&self) -> bool {
        self.slot.borrow().is_none()
    }

    /// Shared views of the segments in arrival order, without consuming the
    /// buffer. Cheap: only the `Bytes` handles are cloned.
    pub fn segments(&self) -> Vec<Bytes> {
        match self.slot.borrow().as_ref() {
            None | Some(Segments::Empty) => Vec::new(),
            Some(Segments::Single(chunk)) => vec![chunk.bytes()],
            Some(Segments::Multi(chunks)) => chunks.iter().map(ChunkBuf::bytes).collect(),
        }
    }

    /// The body as one contiguous `Bytes`. Zero-copy for empty and
    /// single-chunk bodies; multi-chunk bodies are copied into a fresh
    /// allocation.
    pub fn to_bytes(&self) -> Bytes {
        match self.slot.borrow().as_ref() {
            None | Some(Segments::Empty) => Bytes::new(),
            Some(Segments::Single(chunk)) => chunk.bytes(),
            Some(Segments::Multi(chunks)) => {
                let mut out = BytesMut::with_capacity(chunks.iter().map(ChunkBuf::readable_bytes).sum());
                for chunk in chunks {
                    out.put_slice(chunk.as_slice());
                }
                out.freeze()
            }
        }
    }

    /// Releases every chunk held by this buffer. Dropping the buffer has the
    /// same effect; the method makes the release site explicit.
    pub fn release(&self) {
        Self::release_slot(&self.slot);
    }
}

impl Drop for BodyBuf {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for BodyBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyBuf")
            .field("readable_bytes", &self.readable_bytes())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::chunk::audit;

    #[test]
    fn compose_empty() {
        let mut received = Vec::new();
        let buf = BodyBuf::compose(&mut received);
        assert!(buf.is_empty());
        assert_eq!(buf.to_bytes(), Bytes::new());
    }

    #[test]
    fn compose_single_is_zero_copy() {
        audit::reset();

        let mut received = vec![ChunkBuf::from_static(b"hello")];
        let buf = BodyBuf::compose(&mut received);

        assert!(received.is_empty());
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(&buf.to_bytes()[..], b"hello");

        buf.release();
        assert!(buf.is_released());
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn compose_multi_preserves_order() {
        audit::reset();

        let mut received = vec![
            ChunkBuf::from_static(b"hello"),
            ChunkBuf::from_static(b" "),
            ChunkBuf::from_static(b"world"),
        ];
        let buf = BodyBuf::compose(&mut received);

        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.segments().len(), 3);
        assert_eq!(&buf.to_bytes()[..], b"hello world");

        drop(buf);
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn double_release_is_harmless() {
        audit::reset();

        let mut received = vec![ChunkBuf::from_static(b"hello")];
        let buf = BodyBuf::compose(&mut received);

        buf.release();
        buf.release();
        drop(buf);

        let counters = audit::counters();
        assert_eq!(counters.created, 1);
        assert_eq!(counters.released, 1);
    }

    #[test]
    fn slot_hook_releases_when_caller_forgets() {
        audit::reset();

        let mut received = vec![ChunkBuf::from_static(b"hello"), ChunkBuf::from_static(b"world")];
        let buf = BodyBuf::compose(&mut received);
        let slot = buf.slot_handle();

        BodyBuf::release_slot(&slot);
        assert!(buf.is_released());
        assert_eq!(audit::counters().live(), 0);
    }
}
