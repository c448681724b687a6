//! Streaming body reads with demand-driven flow control.
//!
//! [`BodyStream`] is the subscriber-facing half: a cold `futures::Stream`
//! of chunks that doubles as an `http_body::Body` for handlers written
//! against the ecosystem trait. [`WriteSink`] is the producer-facing half
//! the accumulator's listener writes into; it exposes the subscriber's
//! outstanding demand so the listener can decide whether to pull the next
//! chunk from the channel.
//!
//! Polling the stream is the demand signal. Each poll that comes up empty
//! registers a demand of one and asks the accumulator for more; the
//! accumulator answers with at most one `channel.read()` in flight, so the
//! producer can never run more than one chunk ahead of the subscriber.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures::Stream;
use http_body::{Body, Frame, SizeHint};

use crate::protocol::chunk::ChunkBuf;
use crate::protocol::error::BodyError;

use super::req_body::RequestBody;

struct SinkState {
    pending: VecDeque<ChunkBuf>,
    completed: bool,
    error: Option<BodyError>,
    requested: u64,
    waker: Option<Waker>,
}

impl SinkState {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// Producer-side handle the accumulator's streaming listener writes into.
#[derive(Clone)]
pub(crate) struct WriteSink {
    state: Rc<RefCell<SinkState>>,
}

enum SinkPoll {
    Item(ChunkBuf),
    Complete,
    Error(BodyError),
    Empty,
}

impl WriteSink {
    fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SinkState {
                pending: VecDeque::new(),
                completed: false,
                error: None,
                requested: 0,
                waker: None,
            })),
        }
    }

    /// Emits one chunk downstream. Ownership transfers to the subscriber;
    /// the chunk consumes one unit of demand.
    pub(crate) fn item(&self, chunk: ChunkBuf) {
        let mut state = self.state.borrow_mut();
        state.requested = state.requested.saturating_sub(1);
        state.pending.push_back(chunk);
        state.wake();
    }

    pub(crate) fn complete(&self) {
        let mut state = self.state.borrow_mut();
        state.completed = true;
        state.wake();
    }

    /// Fails the stream. Chunks emitted but not yet delivered are released;
    /// the subscriber sees only the error.
    pub(crate) fn error(&self, err: BodyError) {
        let mut state = self.state.borrow_mut();
        state.pending.clear();
        state.error = Some(err);
        state.wake();
    }

    /// Units of demand the subscriber has signaled but not yet received.
    pub(crate) fn requested(&self) -> u64 {
        self.state.borrow().requested
    }

    fn poll_take(&self, cx: &mut Context<'_>) -> SinkPoll {
        let mut state = self.state.borrow_mut();
        if let Some(chunk) = state.pending.pop_front() {
            return SinkPoll::Item(chunk);
        }
        if let Some(err) = state.error.take() {
            return SinkPoll::Error(err);
        }
        if state.completed {
            return SinkPoll::Complete;
        }
        state.requested = 1;
        state.waker = Some(cx.waker().clone());
        SinkPoll::Empty
    }
}

/// The request body as a flow-controlled chunk stream.
///
/// Nothing is read from the channel until the stream is first polled.
/// Dropping the stream before it finishes cancels the read and discards the
/// rest of the body.
pub struct BodyStream {
    body: RequestBody,
    sink: WriteSink,
    subscribed: bool,
    done: bool,
}

impl BodyStream {
    pub(crate) fn new(body: RequestBody) -> Self {
        Self { body, sink: WriteSink::new(), subscribed: false, done: false }
    }
}

impl Stream for BodyStream {
    type Item = Result<ChunkBuf, BodyError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        let mut drove = false;
        loop {
            match this.sink.poll_take(cx) {
                SinkPoll::Item(chunk) => return Poll::Ready(Some(Ok(chunk))),
                SinkPoll::Error(err) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(err)));
                }
                SinkPoll::Complete => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                SinkPoll::Empty => {}
            }
            if drove {
                return Poll::Pending;
            }
            // one demand signal per poll: subscribe on the first, pull one
            // more chunk on the rest
            if this.subscribed {
                this.body.request_more();
            } else {
                this.subscribed = true;
                this.body.subscribe_stream(&this.sink);
            }
            drove = true;
        }
    }
}

impl Body for BodyStream {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match Stream::poll_next(self, cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(Frame::data(chunk.into_bytes())))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done
    }

    fn size_hint(&self) -> SizeHint {
        match self.body.content_length() {
            length if length >= 0 => SizeHint::with_exact(length as u64),
            _ => SizeHint::new(),
        }
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        if self.subscribed && !self.done {
            self.body.cancel_stream();
        }
    }
}
