//! The request body accumulator.
//!
//! One [`RequestBody`] exists per request. The connection's decoder feeds it
//! chunk events through [`RequestBody::add`] and [`RequestBody::on_close`];
//! the application consumes the body exactly once through one of
//! [`RequestBody::read`], [`RequestBody::read_stream`] or
//! [`RequestBody::drain`]. Whichever reader runs first installs a listener,
//! and subsequent chunk events route through it until the terminal chunk,
//! an oversize body or an early close ends the operation.
//!
//! The accumulator never copies payload bytes. Each chunk handle it receives
//! is retained in the buffered list, handed to the active consumer, or
//! released, on every path.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;

use futures::channel::oneshot;
use tracing::{debug, error, trace};

use crate::channel::Channel;
use crate::exec::Execution;
use crate::protocol::chunk::ChunkBuf;
use crate::protocol::error::BodyError;
use crate::protocol::request::RequestHeader;

use super::body_buf::BodyBuf;
use super::body_stream::{BodyStream, WriteSink};

/// Result of draining an unread body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// The remaining body was consumed; the connection can be reused.
    Drained,
    /// The remainder would breach the size ceiling; the connection must be
    /// closed.
    TooLarge,
    /// A prior error already forced the body to be discarded.
    Discarded,
}

/// What [`RequestBody::read`] should do when the body exceeds the ceiling.
///
/// [`OnTooLarge::Reject`] fails the read with [`BodyError::TooLarge`]. A
/// caller-supplied action runs instead of that failure, typically to write
/// an HTTP 413 response; the read then resolves without a buffer.
pub enum OnTooLarge {
    Reject,
    Run(Box<dyn FnOnce() -> Result<(), BodyError>>),
}

impl OnTooLarge {
    pub fn run(action: impl FnOnce() -> Result<(), BodyError> + 'static) -> Self {
        Self::Run(Box::new(action))
    }
}

type ReadReply = Result<Option<BodyBuf>, BodyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Unread,
    Reading,
    Read,
    Discarded,
    TooLarge,
}

impl State {
    fn is_terminal(self) -> bool {
        matches!(self, State::Read | State::Discarded | State::TooLarge)
    }
}

/// The callback installed by the active reader. At most one exists at a
/// time, which is what makes a second reader impossible while the first is
/// in flight.
enum Listener {
    OneShot {
        tx: oneshot::Sender<ReadReply>,
        on_too_large: OnTooLarge,
    },
    Streaming {
        sink: WriteSink,
    },
    Draining {
        tx: oneshot::Sender<DrainOutcome>,
    },
}

/// Channel work decided while the accumulator state is borrowed and carried
/// out after the borrow ends, so channel callbacks can reenter the body.
enum Step {
    Idle,
    /// Issue one `channel.read()`.
    Read,
    /// Write the continue preface if the request expects it, then read.
    Pump,
    FireExpectationFailed,
    /// Run the caller's too-large action (or the default rejection) and
    /// resolve the pending read.
    RunTooLarge {
        tx: oneshot::Sender<ReadReply>,
        on_too_large: OnTooLarge,
        limit: i64,
        length: i64,
    },
}

struct Inner {
    advertised_length: i64,
    max_content_length: i64,
    received_length: i64,
    received: Vec<ChunkBuf>,
    received_last: bool,
    early_close: bool,
    read_in_flight: bool,
    state: State,
    listener: Option<Listener>,
    header: Rc<RequestHeader>,
    channel: Rc<dyn Channel>,
    exec: Rc<Execution>,
}

impl Inner {
    fn exceeds_max(&self, length: i64) -> bool {
        self.max_content_length > 0 && length > 0 && length > self.max_content_length
    }

    fn retain(&mut self, chunk: ChunkBuf) {
        let readable = chunk.readable_bytes();
        if readable > 0 {
            self.received_length += readable as i64;
            trace!(size = readable, total = self.received_length, "retained body chunk");
            self.received.push(chunk);
        } else {
            chunk.release();
        }
    }

    fn release_received(&mut self) {
        for chunk in self.received.drain(..) {
            chunk.release();
        }
    }

    fn discard(&mut self) {
        self.state = State::Discarded;
        self.listener = None;
        self.release_received();
    }

    /// Discards held chunks and enters `TooLarge`. Returns the error pair
    /// for the signal to the consumer.
    fn enter_too_large(&mut self, length: i64) -> (i64, i64) {
        self.release_received();
        self.state = State::TooLarge;
        (self.max_content_length, length)
    }

    fn closed_error(&self) -> BodyError {
        BodyError::connection_closed(self.channel.closure_reason())
    }

    /// Completes a one-shot read with everything received so far. The
    /// composed buffer is released when the request execution completes,
    /// whether or not the caller releases it first.
    fn deliver_composed(&mut self, tx: oneshot::Sender<ReadReply>) {
        self.state = State::Read;
        let buf = BodyBuf::compose(&mut self.received);
        let slot = buf.slot_handle();
        self.exec.on_complete(move || BodyBuf::release_slot(&slot));
        let _ = tx.send(Ok(Some(buf)));
    }

    fn begin_one_shot(&mut self, tx: oneshot::Sender<ReadReply>, on_too_large: OnTooLarge) -> Step {
        if self.state != State::Unread {
            let _ = tx.send(Err(BodyError::already_read()));
            return Step::Idle;
        }
        self.state = State::Reading;

        if self.exceeds_max(self.advertised_length) {
            let (limit, length) = self.enter_too_large(self.advertised_length);
            return Step::RunTooLarge { tx, on_too_large, limit, length };
        }
        if self.exceeds_max(self.received_length) {
            let (limit, length) = self.enter_too_large(self.received_length);
            return Step::RunTooLarge { tx, on_too_large, limit, length };
        }
        if self.received_last {
            self.deliver_composed(tx);
            return Step::Idle;
        }
        if self.early_close {
            let err = self.closed_error();
            self.discard();
            let _ = tx.send(Err(err));
            return Step::Idle;
        }

        self.listener = Some(Listener::OneShot { tx, on_too_large });
        Step::Pump
    }

    fn begin_stream(&mut self, sink: &WriteSink) -> Step {
        if self.state != State::Unread {
            sink.error(BodyError::already_read());
            return Step::Idle;
        }
        self.state = State::Reading;

        if self.exceeds_max(self.advertised_length) || self.exceeds_max(self.received_length) {
            let observed = self.advertised_length.max(self.received_length);
            let (limit, length) = self.enter_too_large(observed);
            sink.error(BodyError::too_large(limit, length));
            return Step::Idle;
        }

        // chunks buffered before subscription go straight to the sink, in
        // arrival order
        for chunk in self.received.drain(..) {
            sink.item(chunk);
        }

        if self.received_last {
            self.state = State::Read;
            sink.complete();
            return Step::Idle;
        }
        if self.early_close {
            let err = self.closed_error();
            self.discard();
            sink.error(err);
            return Step::Idle;
        }

        self.listener = Some(Listener::Streaming { sink: sink.clone() });
        Step::Pump
    }

    fn begin_drain(&mut self, tx: oneshot::Sender<DrainOutcome>) -> Step {
        self.release_received();
        match self.state {
            State::Read => {
                let _ = tx.send(DrainOutcome::Drained);
                return Step::Idle;
            }
            State::TooLarge => {
                let _ = tx.send(DrainOutcome::TooLarge);
                return Step::Idle;
            }
            State::Discarded => {
                let _ = tx.send(DrainOutcome::Discarded);
                return Step::Idle;
            }
            State::Unread | State::Reading => {}
        }

        // an abandoned reader loses its pending result here
        let _ = self.listener.take();
        self.state = State::Reading;

        if self.received_last || self.header.expects_continue() {
            // a pending continue means the client never sent the body; the
            // pipeline is told to refuse it and the connection stays usable
            let refuse_expectation = self.header.expects_continue();
            self.release_received();
            self.state = State::Read;
            let _ = tx.send(DrainOutcome::Drained);
            return if refuse_expectation { Step::FireExpectationFailed } else { Step::Idle };
        }

        if self.exceeds_max(self.advertised_length) || self.exceeds_max(self.received_length) {
            self.release_received();
            self.state = State::TooLarge;
            let _ = tx.send(DrainOutcome::TooLarge);
            return Step::Idle;
        }

        if self.early_close {
            self.state = State::Read;
            let _ = tx.send(DrainOutcome::Drained);
            return Step::Idle;
        }

        self.listener = Some(Listener::Draining { tx });
        // no continue preface here, draining must not invite more bytes
        Step::Read
    }

    fn on_content(&mut self, listener: Listener, chunk: ChunkBuf, is_last: bool) -> Step {
        match listener {
            Listener::OneShot { tx, on_too_large } => {
                self.retain(chunk);
                if self.exceeds_max(self.received_length) {
                    let (limit, length) = self.enter_too_large(self.received_length);
                    Step::RunTooLarge { tx, on_too_large, limit, length }
                } else if is_last {
                    self.deliver_composed(tx);
                    Step::Idle
                } else {
                    self.listener = Some(Listener::OneShot { tx, on_too_large });
                    Step::Read
                }
            }

            Listener::Streaming { sink } => {
                let readable = chunk.readable_bytes() as i64;
                if readable > 0 {
                    self.received_length += readable;
                    if self.exceeds_max(self.received_length) {
                        chunk.release();
                        let (limit, length) = self.enter_too_large(self.received_length);
                        sink.error(BodyError::too_large(limit, length));
                        return Step::Idle;
                    }
                    sink.item(chunk);
                } else {
                    chunk.release();
                }

                if is_last {
                    self.state = State::Read;
                    sink.complete();
                    Step::Idle
                } else {
                    let demand_left = sink.requested() > 0;
                    self.listener = Some(Listener::Streaming { sink });
                    if demand_left { Step::Read } else { Step::Idle }
                }
            }

            Listener::Draining { tx } => {
                let readable = chunk.readable_bytes() as i64;
                chunk.release();
                self.received_length += readable;
                if self.exceeds_max(self.received_length) {
                    self.state = State::TooLarge;
                    let _ = tx.send(DrainOutcome::TooLarge);
                    Step::Idle
                } else if is_last {
                    self.state = State::Read;
                    let _ = tx.send(DrainOutcome::Drained);
                    Step::Idle
                } else {
                    self.listener = Some(Listener::Draining { tx });
                    Step::Read
                }
            }
        }
    }

    fn on_early_close(&mut self, listener: Listener) {
        match listener {
            Listener::OneShot { tx, .. } => {
                let err = self.closed_error();
                self.discard();
                let _ = tx.send(Err(err));
            }
            Listener::Streaming { sink } => {
                let err = self.closed_error();
                self.discard();
                sink.error(err);
            }
            Listener::Draining { tx } => {
                // the peer is gone and so is the rest of the body; nothing is
                // left to drain
                self.state = State::Read;
                let _ = tx.send(DrainOutcome::Drained);
            }
        }
    }
}

/// Accumulates the inbound body of one request and hands it to the
/// application exactly once.
///
/// Cloning yields another handle to the same request body; the decoder side
/// and the handler side each hold one.
#[derive(Clone)]
pub struct RequestBody {
    inner: Rc<RefCell<Inner>>,
}

impl RequestBody {
    pub fn new(
        advertised_length: i64,
        header: Rc<RequestHeader>,
        channel: Rc<dyn Channel>,
        exec: Rc<Execution>,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                advertised_length,
                max_content_length: -1,
                received_length: 0,
                received: Vec::new(),
                received_last: false,
                early_close: false,
                read_in_flight: false,
                state: State::Unread,
                listener: None,
                header,
                channel,
                exec,
            })),
        }
    }

    /// Builds the body for a parsed request, taking the advertised length
    /// from its `Content-Length` header.
    pub fn for_request(header: Rc<RequestHeader>, channel: Rc<dyn Channel>, exec: Rc<Execution>) -> Self {
        let advertised_length = header.advertised_content_length();
        Self::new(advertised_length, header, channel, exec)
    }

    /// Feeds one chunk event from the decoder. `is_last` marks the terminal
    /// chunk, which may carry zero bytes.
    pub fn add(&self, chunk: ChunkBuf, is_last: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.read_in_flight = false;
        if inner.state.is_terminal() {
            drop(inner);
            trace!("releasing chunk received after body reached a terminal state");
            chunk.release();
            return;
        }
        if is_last {
            inner.received_last = true;
        }
        let step = match inner.listener.take() {
            Some(listener) => inner.on_content(listener, chunk, is_last),
            None => {
                inner.retain(chunk);
                Step::Idle
            }
        };
        drop(inner);
        self.perform(step);
    }

    /// Notifies the body that the channel closed. Ignored once the terminal
    /// chunk has been seen.
    pub fn on_close(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.read_in_flight = false;
        if inner.received_last {
            return;
        }
        match inner.listener.take() {
            Some(listener) => inner.on_early_close(listener),
            None => inner.early_close = true,
        }
    }

    /// Reads the whole body into one composed buffer.
    ///
    /// Resolves with `Ok(Some(buf))` on success and `Ok(None)` when a
    /// caller-supplied too-large action ran instead of a default rejection.
    /// The buffer is released when the request execution completes even if
    /// the caller never releases it.
    pub fn read(&self, on_too_large: OnTooLarge) -> impl Future<Output = Result<Option<BodyBuf>, BodyError>> {
        let (tx, rx) = oneshot::channel();
        let step = self.inner.borrow_mut().begin_one_shot(tx, on_too_large);
        self.perform(step);
        async move {
            match rx.await {
                Ok(reply) => reply,
                Err(_) => Err(BodyError::connection_closed(None)),
            }
        }
    }

    /// Reads the body as a chunk stream with demand-driven flow control.
    ///
    /// The stream is cold: nothing happens until it is first polled. At most
    /// one `channel.read()` is outstanding at a time, so the peer can never
    /// run more than one chunk ahead of the subscriber.
    pub fn read_stream(&self) -> BodyStream {
        BodyStream::new(self.clone())
    }

    /// Discards any unread body so the connection can be reused, or reports
    /// that it cannot be.
    pub fn drain(&self) -> impl Future<Output = DrainOutcome> {
        let (tx, rx) = oneshot::channel();
        let step = self.inner.borrow_mut().begin_drain(tx);
        self.perform(step);
        async move { rx.await.unwrap_or(DrainOutcome::Discarded) }
    }

    /// The length advertised by the request's `Content-Length` header, or
    /// `-1` when absent or chunked.
    pub fn content_length(&self) -> i64 {
        self.inner.borrow().advertised_length
    }

    /// The configured body size ceiling. Non-positive means unlimited.
    pub fn max_content_length(&self) -> i64 {
        self.inner.borrow().max_content_length
    }

    pub fn set_max_content_length(&self, max_content_length: i64) {
        self.inner.borrow_mut().max_content_length = max_content_length;
    }

    pub(crate) fn subscribe_stream(&self, sink: &WriteSink) {
        let step = self.inner.borrow_mut().begin_stream(sink);
        self.perform(step);
    }

    /// One `request(1)` signal from the stream while its listener is
    /// installed: pull one more chunk.
    pub(crate) fn request_more(&self) {
        let armed = matches!(self.inner.borrow().listener, Some(Listener::Streaming { .. }));
        if armed {
            self.issue_read();
        }
    }

    pub(crate) fn cancel_stream(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.state == State::Reading {
            debug!("streaming body read cancelled, discarding the rest");
            inner.discard();
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> State {
        self.inner.borrow().state
    }

    fn perform(&self, step: Step) {
        match step {
            Step::Idle => {}
            Step::Read => self.issue_read(),
            Step::Pump => self.pump(),
            Step::FireExpectationFailed => {
                let channel = self.inner.borrow().channel.clone();
                channel.fire_expectation_failed();
            }
            Step::RunTooLarge { tx, on_too_large, limit, length } => {
                let reply = match on_too_large {
                    OnTooLarge::Reject => Err(BodyError::too_large(limit, length)),
                    OnTooLarge::Run(action) => action().map(|()| None),
                };
                let _ = tx.send(reply);
            }
        }
    }

    /// Requests one more chunk unless a read is already outstanding.
    fn issue_read(&self) {
        let channel = {
            let mut inner = self.inner.borrow_mut();
            if inner.read_in_flight {
                return;
            }
            inner.read_in_flight = true;
            inner.channel.clone()
        };
        channel.read();
    }

    /// Kicks the transport for the first reader-caused read, preceded by the
    /// continue preface when the request expects one.
    fn pump(&self) {
        let (expects_continue, channel) = {
            let inner = self.inner.borrow();
            (inner.header.expects_continue(), inner.channel.clone())
        };
        if expects_continue {
            debug!("writing continue preface before first body read");
            let body = self.clone();
            channel.write_continue(Box::new(move |result| match result {
                Ok(()) => body.issue_read(),
                Err(e) => body.fail_active(BodyError::channel(e)),
            }));
        } else {
            self.issue_read();
        }
    }

    /// Fails whichever reader is currently installed, after discarding held
    /// chunks. Used for transport failures such as a broken continue write.
    fn fail_active(&self, err: BodyError) {
        error!(error = %err, "failing active body reader");
        let mut inner = self.inner.borrow_mut();
        match inner.listener.take() {
            Some(Listener::OneShot { tx, .. }) => {
                inner.discard();
                let _ = tx.send(Err(err));
            }
            Some(Listener::Streaming { sink }) => {
                inner.discard();
                sink.error(err);
            }
            Some(Listener::Draining { tx }) => {
                // the drainer reports reusability, not transport errors
                inner.state = State::Read;
                let _ = tx.send(DrainOutcome::Drained);
            }
            None => {
                if !inner.state.is_terminal() {
                    inner.discard();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{Op, TestChannel};
    use crate::protocol::chunk::audit;

    use futures::task::noop_waker_ref;
    use futures::FutureExt;
    use std::task::Context;

    struct Fixture {
        body: RequestBody,
        channel: Rc<TestChannel>,
        exec: Rc<Execution>,
    }

    fn fixture(max: i64, advertised: i64) -> Fixture {
        fixture_with(max, advertised, TestChannel::new(), &[])
    }

    fn fixture_with(max: i64, advertised: i64, channel: TestChannel, headers: &[(&str, &str)]) -> Fixture {
        audit::reset();
        let mut builder = http::Request::builder().method("POST").uri("/upload");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let header: RequestHeader = builder.body(()).unwrap().into();
        let channel = Rc::new(channel);
        let exec = Rc::new(Execution::new());
        let body =
            RequestBody::new(advertised, Rc::new(header), channel.clone() as Rc<dyn Channel>, exec.clone());
        body.set_max_content_length(max);
        Fixture { body, channel, exec }
    }

    fn chunk(data: &'static [u8]) -> ChunkBuf {
        ChunkBuf::from_static(data)
    }

    #[test]
    fn read_composes_chunks_in_arrival_order() {
        let f = fixture(100, 50);
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut fut = Box::pin(f.body.read(OnTooLarge::Reject));
        assert!(fut.poll_unpin(&mut cx).is_pending());
        assert_eq!(f.channel.reads(), 1);

        f.body.add(chunk(b"01234567890123456789"), false);
        assert_eq!(f.channel.reads(), 2);
        f.body.add(chunk(b"abcdefghijabcdefghij"), false);
        assert_eq!(f.channel.reads(), 3);
        f.body.add(chunk(b"XXXXXXXXXX"), true);
        assert_eq!(f.channel.reads(), 3);

        let buf = fut.poll_unpin(&mut cx).map(|r| r.unwrap().unwrap());
        let buf = match buf {
            std::task::Poll::Ready(buf) => buf,
            std::task::Poll::Pending => panic!("read did not resolve"),
        };
        assert_eq!(buf.readable_bytes(), 50);
        assert_eq!(&buf.to_bytes()[..], b"01234567890123456789abcdefghijabcdefghijXXXXXXXXXX");
        assert_eq!(f.body.state(), State::Read);

        drop(buf);
        f.exec.complete();
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn read_fast_fails_when_advertised_length_exceeds_limit() {
        let f = fixture(100, 200);

        let result = f.body.read(OnTooLarge::Reject).now_or_never().unwrap();
        assert!(matches!(result, Err(BodyError::TooLarge { limit: 100, length: 200 })));
        assert_eq!(f.channel.reads(), 0);
        assert_eq!(f.body.state(), State::TooLarge);

        // a straggling chunk is released on arrival
        f.body.add(chunk(b"late"), false);
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn read_fails_when_buffered_chunks_already_exceed_limit() {
        let f = fixture(100, -1);

        f.body.add(chunk(&[0u8; 60]), false);
        f.body.add(chunk(&[0u8; 60]), false);

        let result = f.body.read(OnTooLarge::Reject).now_or_never().unwrap();
        assert!(matches!(result, Err(BodyError::TooLarge { limit: 100, length: 120 })));
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn read_fails_when_a_late_chunk_breaches_the_limit() {
        let f = fixture(100, -1);
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut fut = Box::pin(f.body.read(OnTooLarge::Reject));
        assert!(fut.poll_unpin(&mut cx).is_pending());

        f.body.add(chunk(&[0u8; 100]), false);
        assert!(fut.poll_unpin(&mut cx).is_pending());
        f.body.add(chunk(&[0u8; 1]), false);

        let result = fut.now_or_never().unwrap();
        assert!(matches!(result, Err(BodyError::TooLarge { limit: 100, length: 101 })));
        assert_eq!(f.body.state(), State::TooLarge);
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn chunk_exactly_at_the_limit_is_accepted() {
        let f = fixture(100, -1);
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut fut = Box::pin(f.body.read(OnTooLarge::Reject));
        assert!(fut.poll_unpin(&mut cx).is_pending());

        f.body.add(chunk(&[7u8; 100]), true);

        let buf = fut.now_or_never().unwrap().unwrap().unwrap();
        assert_eq!(buf.readable_bytes(), 100);
    }

    #[tokio::test]
    async fn zero_byte_body_yields_empty_buffer() {
        let f = fixture(100, 0);

        f.body.add(chunk(b""), true);

        let buf = f.body.read(OnTooLarge::Reject).await.unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(f.body.state(), State::Read);
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn second_read_fails_already_read() {
        let f = fixture(100, 5);

        f.body.add(chunk(b"hello"), true);
        let first = f.body.read(OnTooLarge::Reject).now_or_never().unwrap();
        assert!(first.is_ok());

        let second = f.body.read(OnTooLarge::Reject).now_or_never().unwrap();
        assert!(matches!(second, Err(BodyError::AlreadyRead)));
        // the failed attempt mutates nothing
        assert_eq!(f.body.state(), State::Read);
        assert_eq!(f.channel.reads(), 0);
    }

    #[test]
    fn continue_preface_is_written_once_before_the_first_read() {
        let f = fixture_with(100, 30, TestChannel::new(), &[("expect", "100-continue")]);
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut fut = Box::pin(f.body.read(OnTooLarge::Reject));
        assert!(fut.poll_unpin(&mut cx).is_pending());
        assert_eq!(f.channel.ops(), vec![Op::WriteContinue, Op::Read]);

        f.body.add(chunk(&[1u8; 30]), true);

        let buf = fut.now_or_never().unwrap().unwrap().unwrap();
        assert_eq!(buf.readable_bytes(), 30);
        assert_eq!(f.channel.continue_writes(), 1);
    }

    #[test]
    fn failed_continue_write_fails_the_read() {
        let f = fixture_with(100, 30, TestChannel::new().manual_writes(), &[("expect", "100-continue")]);
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut fut = Box::pin(f.body.read(OnTooLarge::Reject));
        assert!(fut.poll_unpin(&mut cx).is_pending());

        f.channel.complete_write(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone")));

        let result = fut.now_or_never().unwrap();
        assert!(matches!(result, Err(BodyError::Channel { .. })));
        assert_eq!(f.body.state(), State::Discarded);
        assert_eq!(f.channel.reads(), 0);
    }

    #[test]
    fn early_close_before_read_fails_connection_closed() {
        let f = fixture_with(100, 30, TestChannel::new().with_closure_reason("reset by peer"), &[]);

        f.body.on_close();

        let result = f.body.read(OnTooLarge::Reject).now_or_never().unwrap();
        match result {
            Err(BodyError::ConnectionClosed { reason }) => assert_eq!(reason.as_deref(), Some("reset by peer")),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(f.body.state(), State::Discarded);

        let outcome = f.body.drain().now_or_never().unwrap();
        assert_eq!(outcome, DrainOutcome::Discarded);
    }

    #[test]
    fn early_close_during_read_fails_connection_closed() {
        let f = fixture(100, 30);
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut fut = Box::pin(f.body.read(OnTooLarge::Reject));
        assert!(fut.poll_unpin(&mut cx).is_pending());

        f.body.add(chunk(b"part"), false);
        f.body.on_close();

        let result = fut.now_or_never().unwrap();
        assert!(matches!(result, Err(BodyError::ConnectionClosed { .. })));
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn too_large_action_replaces_the_failure() {
        let f = fixture(100, 200);
        let responded = Rc::new(std::cell::Cell::new(false));

        let flag = responded.clone();
        let result = f
            .body
            .read(OnTooLarge::run(move || {
                flag.set(true);
                Ok(())
            }))
            .now_or_never()
            .unwrap();

        assert!(responded.get());
        assert!(matches!(result, Ok(None)));
        assert_eq!(f.body.state(), State::TooLarge);
    }

    #[test]
    fn too_large_action_error_propagates_verbatim() {
        let f = fixture(100, 200);

        let result = f
            .body
            .read(OnTooLarge::run(|| Err(BodyError::connection_closed(Some("handler bailed".into())))))
            .now_or_never()
            .unwrap();

        match result {
            Err(BodyError::ConnectionClosed { reason }) => assert_eq!(reason.as_deref(), Some("handler bailed")),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn composed_buffer_is_released_on_execution_completion() {
        let f = fixture(100, 10);

        f.body.add(chunk(b"0123456789"), true);
        let buf = f.body.read(OnTooLarge::Reject).now_or_never().unwrap().unwrap().unwrap();
        assert!(!buf.is_released());

        // the caller forgets to release; completion cleans up
        f.exec.complete();
        assert!(buf.is_released());
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn drain_after_read_reports_drained() {
        let f = fixture(100, 5);

        f.body.add(chunk(b"hello"), true);
        let _ = f.body.read(OnTooLarge::Reject).now_or_never().unwrap();

        assert_eq!(f.body.drain().now_or_never().unwrap(), DrainOutcome::Drained);
        assert_eq!(f.body.drain().now_or_never().unwrap(), DrainOutcome::Drained);
    }

    #[test]
    fn drain_of_fully_buffered_body_releases_it() {
        let f = fixture(100, 5);

        f.body.add(chunk(b"hello"), true);
        assert_eq!(f.body.drain().now_or_never().unwrap(), DrainOutcome::Drained);
        assert_eq!(f.body.state(), State::Read);
        assert_eq!(f.channel.reads(), 0);
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn drain_pulls_the_rest_of_the_body() {
        let f = fixture(100, 50);
        let mut cx = Context::from_waker(noop_waker_ref());

        f.body.add(chunk(&[0u8; 20]), false);

        let mut fut = Box::pin(f.body.drain());
        assert!(fut.poll_unpin(&mut cx).is_pending());
        assert_eq!(f.channel.reads(), 1);

        f.body.add(chunk(&[0u8; 20]), false);
        assert_eq!(f.channel.reads(), 2);
        f.body.add(chunk(&[0u8; 10]), true);

        assert_eq!(fut.now_or_never().unwrap(), DrainOutcome::Drained);
        assert_eq!(f.body.state(), State::Read);
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn drain_reports_too_large_without_reading_when_advertised_exceeds_limit() {
        let f = fixture(100, 200);

        assert_eq!(f.body.drain().now_or_never().unwrap(), DrainOutcome::TooLarge);
        assert_eq!(f.channel.reads(), 0);
        assert_eq!(f.body.drain().now_or_never().unwrap(), DrainOutcome::TooLarge);
    }

    #[test]
    fn drain_reports_too_large_when_the_remainder_breaches_the_limit() {
        let f = fixture(100, -1);
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut fut = Box::pin(f.body.drain());
        assert!(fut.poll_unpin(&mut cx).is_pending());

        f.body.add(chunk(&[0u8; 80]), false);
        f.body.add(chunk(&[0u8; 80]), false);

        assert_eq!(fut.now_or_never().unwrap(), DrainOutcome::TooLarge);
        assert_eq!(f.body.state(), State::TooLarge);
        assert_eq!(audit::counters().live(), 0);
    }

    #[test]
    fn drain_refuses_a_pending_expectation_instead_of_inviting_the_body() {
        let f = fixture_with(100, 30, TestChannel::new(), &[("expect", "100-continue")]);

        assert_eq!(f.body.drain().now_or_never().unwrap(), DrainOutcome::Drained);
        assert_eq!(f.channel.continue_writes(), 0);
        assert_eq!(f.channel.expectation_failures(), 1);
        assert_eq!(f.channel.reads(), 0);
        assert_eq!(f.body.state(), State::Read);
    }

    #[test]
    fn drain_after_early_close_reports_drained() {
        let f = fixture(100, 30);

        f.body.on_close();

        assert_eq!(f.body.drain().now_or_never().unwrap(), DrainOutcome::Drained);
        assert_eq!(f.body.state(), State::Read);
    }

    #[test]
    fn drain_resolves_drained_when_the_channel_closes_mid_drain() {
        let f = fixture(100, 50);
        let mut cx = Context::from_waker(noop_waker_ref());

        let mut fut = Box::pin(f.body.drain());
        assert!(fut.poll_unpin(&mut cx).is_pending());

        f.body.add(chunk(&[0u8; 20]), false);
        f.body.on_close();

        assert_eq!(fut.now_or_never().unwrap(), DrainOutcome::Drained);
        assert_eq!(audit::counters().live(), 0);
    }

    #[tokio::test]
    async fn read_after_drain_fails_already_read() {
        let f = fixture(100, 5);

        f.body.add(chunk(b"hello"), true);
        assert_eq!(f.body.drain().await, DrainOutcome::Drained);

        let result = f.body.read(OnTooLarge::Reject).await;
        assert!(matches!(result, Err(BodyError::AlreadyRead)));
    }

    #[test]
    fn reader_after_too_large_fails_already_read() {
        let f = fixture(100, 200);
        assert_eq!(f.body.content_length(), 200);
        assert_eq!(f.body.max_content_length(), 100);

        let _ = f.body.read(OnTooLarge::Reject).now_or_never().unwrap();

        let second = f.body.read(OnTooLarge::Reject).now_or_never().unwrap();
        assert!(matches!(second, Err(BodyError::AlreadyRead)));
        assert_eq!(f.body.state(), State::TooLarge);
    }

    #[test]
    fn chunks_after_completion_are_released() {
        let f = fixture(100, 5);

        f.body.add(chunk(b"hello"), true);
        let buf = f.body.read(OnTooLarge::Reject).now_or_never().unwrap().unwrap().unwrap();
        drop(buf);

        f.body.add(chunk(b"ghost"), false);
        f.body.add(chunk(b""), true);

        assert_eq!(audit::counters().live(), 0);
        assert_eq!(f.body.state(), State::Read);
    }
}
