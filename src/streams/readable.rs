use std::{
    collections::VecDeque,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{poll_fn, BoxFuture},
    pin_mut, select,
    stream::{Stream, StreamExt},
    FutureExt,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    error::{StreamError, StreamResult},
    queue::SizedQueue,
    CountQueuingStrategy, Locked, QueuingStrategy, Unlocked, WakerSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableState {
    Readable,
    Closed,
    Errored,
}

/// Capability surface a readable-side controller variant must provide.
///
/// The default controller below implements it; a byte-oriented controller
/// living outside this crate satisfies the same surface, which is all the
/// stream machinery depends on.
pub trait EnqueueController<T> {
    fn enqueue(&self, chunk: T) -> StreamResult<()>;
    fn close(&self) -> StreamResult<()>;
    fn error(&self, error: StreamError);
    fn desired_size(&self) -> Option<f64>;
}

// ----------- Source trait -----------

/// The caller-supplied producer algorithms behind a readable stream.
///
/// `start` and `cancel` default to no-ops; `pull` is where chunks come from.
/// A source that pushes data on its own schedule can hold on to the
/// controller handed to `start` and return a pending future from `pull`.
pub trait ReadableSource<T: Send + 'static>: Send + 'static {
    fn start(
        &mut self,
        controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + Send {
        let _ = controller;
        async { Ok(()) }
    }

    fn pull(
        &mut self,
        controller: &ReadableStreamDefaultController<T>,
    ) -> impl Future<Output = StreamResult<()>> + Send;

    fn cancel(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + Send {
        let _ = reason;
        async { Ok(()) }
    }
}

// ----------- Commands and controller messages -----------

enum StreamCommand<T> {
    Read {
        completion: oneshot::Sender<StreamResult<Option<T>>>,
    },
    Cancel {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    RegisterClosedWaker {
        waker: std::task::Waker,
    },
}

enum ControllerMsg<T> {
    Enqueue { chunk: T },
    Close,
    Error(StreamError),
}

// ----------- Shared observable state -----------

struct SharedReadableState {
    queue_total_size: AtomicU64,
    high_water_mark: f64,
    closed: AtomicBool,
    errored: AtomicBool,
    close_requested: AtomicBool,
    locked: AtomicBool,
    stored_error: Mutex<Option<StreamError>>,
}

impl SharedReadableState {
    fn new(high_water_mark: f64) -> Self {
        Self {
            queue_total_size: AtomicU64::new(0f64.to_bits()),
            high_water_mark,
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            stored_error: Mutex::new(None),
        }
    }

    fn total_size(&self) -> f64 {
        f64::from_bits(self.queue_total_size.load(Ordering::SeqCst))
    }

    fn set_total_size(&self, total: f64) {
        self.queue_total_size
            .store(total.to_bits(), Ordering::SeqCst);
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .lock()
            .clone()
            .unwrap_or(StreamError::State("stream is errored"))
    }

    fn set_stored_error(&self, error: StreamError) {
        *self.stored_error.lock() = Some(error);
    }
}

// ----------- Default controller -----------

/// Handle given to the source algorithms for feeding the stream.
///
/// Cheap to clone; all methods are callable from any task. `enqueue` and
/// `close` fail synchronously once the stream is no longer enqueueable.
pub struct ReadableStreamDefaultController<T: Send + 'static> {
    tx: UnboundedSender<ControllerMsg<T>>,
    shared: Arc<SharedReadableState>,
}

impl<T: Send + 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> ReadableStreamDefaultController<T> {
    pub fn desired_size(&self) -> Option<f64> {
        if self.shared.closed.load(Ordering::SeqCst) || self.shared.errored.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.shared.high_water_mark - self.shared.total_size())
    }

    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::State(
                "cannot enqueue, the stream is closing or no longer readable",
            ));
        }
        self.tx
            .unbounded_send(ControllerMsg::Enqueue { chunk })
            .map_err(|_| StreamError::TaskDropped)
    }

    /// Request a close. With chunks still queued the stream stays readable
    /// until they drain; further enqueues fail immediately.
    pub fn close(&self) -> StreamResult<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::State(
                "cannot close, the stream is already closing or no longer readable",
            ));
        }
        self.shared.close_requested.store(true, Ordering::SeqCst);
        self.tx
            .unbounded_send(ControllerMsg::Close)
            .map_err(|_| StreamError::TaskDropped)
    }

    pub fn error(&self, error: StreamError) {
        let _ = self.tx.unbounded_send(ControllerMsg::Error(error));
    }

    fn can_close_or_enqueue(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
            && !self.shared.errored.load(Ordering::SeqCst)
            && !self.shared.close_requested.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> EnqueueController<T> for ReadableStreamDefaultController<T> {
    fn enqueue(&self, chunk: T) -> StreamResult<()> {
        ReadableStreamDefaultController::enqueue(self, chunk)
    }

    fn close(&self) -> StreamResult<()> {
        ReadableStreamDefaultController::close(self)
    }

    fn error(&self, error: StreamError) {
        ReadableStreamDefaultController::error(self, error)
    }

    fn desired_size(&self) -> Option<f64> {
        ReadableStreamDefaultController::desired_size(self)
    }
}

// ----------- Driver-side state -----------

struct ReadableStreamInner<T> {
    state: ReadableState,
    queue: SizedQueue<T>,
    strategy: Box<dyn QueuingStrategy<T> + Send>,
    pulling: bool,
    pull_again: bool,
    close_requested: bool,
    cancel_requested: bool,
    cancel_reason: Option<String>,
    cancel_completions: Vec<oneshot::Sender<StreamResult<()>>>,
    pending_reads: VecDeque<oneshot::Sender<StreamResult<Option<T>>>>,
    closed_wakers: WakerSet,
    stored_error: Option<StreamError>,
    shared: Arc<SharedReadableState>,
}

impl<T: Send + 'static> ReadableStreamInner<T> {
    fn new(strategy: Box<dyn QueuingStrategy<T> + Send>, shared: Arc<SharedReadableState>) -> Self {
        Self {
            state: ReadableState::Readable,
            queue: SizedQueue::new(),
            strategy,
            pulling: false,
            pull_again: false,
            close_requested: false,
            cancel_requested: false,
            cancel_reason: None,
            cancel_completions: Vec::new(),
            pending_reads: VecDeque::new(),
            closed_wakers: WakerSet::new(),
            stored_error: None,
            shared,
        }
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or(StreamError::State("stream is errored"))
    }

    fn desired_size(&self) -> f64 {
        self.shared.high_water_mark - self.queue.total_size()
    }

    fn sync_total_size(&self) {
        self.shared.set_total_size(self.queue.total_size());
    }

    /// Coalesce a pull requested while one is outstanding.
    fn request_pull(&mut self) {
        if self.pulling {
            self.pull_again = true;
        }
    }

    fn should_pull(&self) -> bool {
        !self.pulling
            && self.state == ReadableState::Readable
            && !self.close_requested
            && !self.cancel_requested
            && (!self.pending_reads.is_empty() || self.desired_size() > 0.0)
    }

    /// Canonical error path: store, reset the queue, reject everything.
    fn error_stream(&mut self, error: StreamError) {
        if self.state != ReadableState::Readable {
            return;
        }
        debug!(error = %error, "readable stream errored");
        self.state = ReadableState::Errored;
        self.stored_error = Some(error.clone());
        self.shared.set_stored_error(error.clone());
        self.shared.errored.store(true, Ordering::SeqCst);
        self.queue.reset();
        self.sync_total_size();
        while let Some(completion) = self.pending_reads.pop_front() {
            let _ = completion.send(Err(error.clone()));
        }
        self.closed_wakers.wake_all();
    }

    /// Close now: only legal once the queue is empty.
    fn finish_close(&mut self) {
        if self.state != ReadableState::Readable {
            return;
        }
        trace!("readable stream closed");
        self.state = ReadableState::Closed;
        self.shared.closed.store(true, Ordering::SeqCst);
        while let Some(completion) = self.pending_reads.pop_front() {
            let _ = completion.send(Ok(None));
        }
        self.closed_wakers.wake_all();
    }

    fn process_controller_msg(&mut self, msg: ControllerMsg<T>) {
        match msg {
            ControllerMsg::Enqueue { chunk } => {
                if self.state != ReadableState::Readable || self.close_requested {
                    return;
                }
                if let Some(completion) = self.pending_reads.pop_front() {
                    // A read is already waiting: hand the chunk over directly.
                    let _ = completion.send(Ok(Some(chunk)));
                } else {
                    let size = self.strategy.size(&chunk);
                    if let Err(error) = self.queue.enqueue(chunk, size) {
                        // The size algorithm failed; its error becomes the
                        // stream's error.
                        self.error_stream(error);
                        return;
                    }
                    self.sync_total_size();
                }
                self.request_pull();
            }
            ControllerMsg::Close => {
                if self.state != ReadableState::Readable || self.close_requested {
                    return;
                }
                self.close_requested = true;
                self.shared.close_requested.store(true, Ordering::SeqCst);
                if self.queue.is_empty() {
                    self.finish_close();
                }
            }
            ControllerMsg::Error(error) => self.error_stream(error),
        }
    }

    fn process_command(&mut self, cmd: StreamCommand<T>) {
        match cmd {
            StreamCommand::Read { completion } => match self.state {
                ReadableState::Errored => {
                    let _ = completion.send(Err(self.stored_error()));
                }
                ReadableState::Closed => {
                    let _ = completion.send(Ok(None));
                }
                ReadableState::Readable => {
                    if let Some(element) = self.queue.dequeue() {
                        self.sync_total_size();
                        let _ = completion.send(Ok(Some(element.value)));
                        if self.close_requested && self.queue.is_empty() {
                            self.finish_close();
                        } else {
                            self.request_pull();
                        }
                    } else {
                        self.pending_reads.push_back(completion);
                        self.request_pull();
                    }
                }
            },
            StreamCommand::Cancel { reason, completion } => {
                if self.state != ReadableState::Readable {
                    let _ = completion.send(Ok(()));
                    return;
                }
                if self.cancel_requested {
                    self.cancel_completions.push(completion);
                    return;
                }
                trace!(?reason, "readable stream cancel requested");
                self.cancel_requested = true;
                self.cancel_reason = reason;
                self.cancel_completions.push(completion);
                // Cancel closes the stream; pending reads settle as done.
                self.queue.reset();
                self.sync_total_size();
                self.finish_close();
            }
            StreamCommand::RegisterClosedWaker { waker } => {
                self.closed_wakers.register(&waker);
                if self.state != ReadableState::Readable {
                    self.closed_wakers.wake_all();
                }
            }
        }
    }
}

// ----------- Driver task -----------

enum PullOutcome {
    Settled(StreamResult<()>),
    Interrupted,
}

async fn readable_stream_task<T, Source>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg<T>>,
    mut inner: ReadableStreamInner<T>,
    controller: ReadableStreamDefaultController<T>,
    source: Source,
) where
    T: Send + 'static,
    Source: ReadableSource<T>,
{
    let mut source_slot = Some(source);
    let mut commands_done = false;

    // Run start to settlement before anything else; commands queue up in the
    // channels meanwhile.
    if let Some(source) = source_slot.as_mut() {
        if let Err(error) = source.start(&controller).await {
            inner.error_stream(error);
            source_slot = None;
        }
    }

    loop {
        // Apply whatever arrived while we were busy.
        while let Ok(Some(msg)) = ctrl_rx.try_next() {
            inner.process_controller_msg(msg);
        }
        while let Ok(Some(cmd)) = command_rx.try_next() {
            inner.process_command(cmd);
        }

        // A requested cancel runs the cancel algorithm, then detaches it.
        if inner.cancel_requested {
            let reason = inner.cancel_reason.take();
            let result = match source_slot.take() {
                Some(mut source) => source.cancel(reason).await,
                None => Ok(()),
            };
            inner.cancel_requested = false;
            for completion in inner.cancel_completions.drain(..) {
                let _ = completion.send(result.clone());
            }
            continue;
        }

        // Once the stream leaves the readable state the algorithms are
        // detached and never invoked again.
        if inner.state != ReadableState::Readable {
            source_slot = None;
        }

        if commands_done {
            // Every public handle is gone; nobody can observe us anymore.
            return;
        }

        if inner.should_pull() && source_slot.is_some() {
            let Some(mut source) = source_slot.take() else {
                continue;
            };
            inner.pulling = true;
            let outcome = {
                let pull_fut = source.pull(&controller).fuse();
                pin_mut!(pull_fut);
                loop {
                    select! {
                        result = pull_fut => break PullOutcome::Settled(result),
                        msg = ctrl_rx.next() => {
                            if let Some(msg) = msg {
                                inner.process_controller_msg(msg);
                            }
                        }
                        cmd = command_rx.next() => {
                            match cmd {
                                Some(cmd) => inner.process_command(cmd),
                                None => commands_done = true,
                            }
                        }
                    }
                    if inner.state != ReadableState::Readable
                        || inner.cancel_requested
                        || commands_done
                    {
                        break PullOutcome::Interrupted;
                    }
                }
            };
            inner.pulling = false;
            if std::mem::take(&mut inner.pull_again) {
                trace!("pull requested mid-pull; re-evaluating");
            }
            match outcome {
                PullOutcome::Settled(Ok(())) => {
                    if inner.state == ReadableState::Readable && !inner.cancel_requested {
                        source_slot = Some(source);
                    }
                }
                PullOutcome::Settled(Err(error)) => {
                    inner.error_stream(error);
                }
                PullOutcome::Interrupted => {
                    // The stream closed, errored or was canceled mid-pull and
                    // the in-flight pull is abandoned. Cancel still needs the
                    // source for its own algorithm.
                    if inner.cancel_requested {
                        source_slot = Some(source);
                    }
                }
            }
            continue;
        }

        // Idle: wait for the next command or controller message.
        select! {
            msg = ctrl_rx.next() => {
                if let Some(msg) = msg {
                    inner.process_controller_msg(msg);
                }
            }
            cmd = command_rx.next() => {
                match cmd {
                    Some(cmd) => inner.process_command(cmd),
                    None => commands_done = true,
                }
            }
        }
    }
}

// ----------- Public stream handle -----------

/// A readable stream handle. The producer algorithms live in the driver
/// future returned at construction; this handle (and readers locked from it)
/// talk to that driver over channels.
pub struct ReadableStream<T: Send + 'static, LockState = Unlocked> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    shared: Arc<SharedReadableState>,
    _lock: PhantomData<LockState>,
}

impl<T: Send + 'static, LockState> ReadableStream<T, LockState> {
    fn handle<L>(&self) -> ReadableStream<T, L> {
        ReadableStream {
            command_tx: self.command_tx.clone(),
            shared: Arc::clone(&self.shared),
            _lock: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.shared.locked.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ReadableState {
        if self.shared.errored.load(Ordering::SeqCst) {
            ReadableState::Errored
        } else if self.shared.closed.load(Ordering::SeqCst) {
            ReadableState::Closed
        } else {
            ReadableState::Readable
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn is_errored(&self) -> bool {
        self.shared.errored.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> ReadableStream<T, Unlocked> {
    pub(crate) fn new_inner<Source>(
        source: Source,
        strategy: Box<dyn QueuingStrategy<T> + Send>,
    ) -> (Self, impl Future<Output = ()> + Send)
    where
        Source: ReadableSource<T>,
    {
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let shared = Arc::new(SharedReadableState::new(strategy.high_water_mark()));

        let controller = ReadableStreamDefaultController {
            tx: ctrl_tx,
            shared: Arc::clone(&shared),
        };
        let inner = ReadableStreamInner::new(strategy, Arc::clone(&shared));
        let task = readable_stream_task(command_rx, ctrl_rx, inner, controller, source);

        let stream = Self {
            command_tx,
            shared,
            _lock: PhantomData,
        };
        (stream, task)
    }

    /// Acquire the stream's single reader. Fails with `Locked` if one is
    /// already live.
    pub fn get_reader(
        &self,
    ) -> StreamResult<(ReadableStream<T, Locked>, ReadableStreamDefaultReader<T>)> {
        if self
            .shared
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::Locked);
        }
        Ok((
            self.handle::<Locked>(),
            ReadableStreamDefaultReader::new(self.handle::<Locked>()),
        ))
    }

    /// Cancel the stream. Fails with `Locked` while a reader is live.
    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        send_cancel(&self.command_tx, reason).await
    }
}

async fn send_cancel<T: Send + 'static>(
    command_tx: &UnboundedSender<StreamCommand<T>>,
    reason: Option<String>,
) -> StreamResult<()> {
    let (tx, rx) = oneshot::channel();
    command_tx
        .unbounded_send(StreamCommand::Cancel {
            reason,
            completion: tx,
        })
        .map_err(|_| StreamError::TaskDropped)?;
    rx.await.unwrap_or(Err(StreamError::TaskDropped))
}

// ----------- Builder -----------

pub struct ReadableStreamBuilder<T: Send + 'static, Source> {
    source: Source,
    strategy: Box<dyn QueuingStrategy<T> + Send>,
}

impl<T, Source> ReadableStreamBuilder<T, Source>
where
    T: Send + 'static,
    Source: ReadableSource<T>,
{
    fn new(source: Source) -> Self {
        Self {
            source,
            strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn strategy<S: QueuingStrategy<T> + 'static>(mut self, strategy: S) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    /// Validate the configuration and return the stream together with its
    /// unspawned driver future.
    pub fn prepare(
        self,
    ) -> StreamResult<(ReadableStream<T, Unlocked>, impl Future<Output = ()> + Send)> {
        super::validate_high_water_mark(self.strategy.high_water_mark())?;
        Ok(ReadableStream::new_inner(self.source, self.strategy))
    }

    /// Hand the driver future to a spawner and return the stream.
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<ReadableStream<T, Unlocked>>
    where
        F: FnOnce(BoxFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

impl<T: Send + 'static> ReadableStream<T, Unlocked> {
    pub fn builder<Source>(source: Source) -> ReadableStreamBuilder<T, Source>
    where
        Source: ReadableSource<T>,
    {
        ReadableStreamBuilder::new(source)
    }
}

// ----------- Convenience sources -----------

pub struct IteratorSource<I: Send + 'static> {
    iter: I,
}

impl<I, T> ReadableSource<T> for IteratorSource<I>
where
    I: Iterator<Item = T> + Send + 'static,
    T: Send + 'static,
{
    async fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StreamResult<()> {
        if let Some(item) = self.iter.next() {
            controller.enqueue(item)?;
        } else {
            controller.close()?;
        }
        Ok(())
    }
}

pub struct AsyncStreamSource<S: Send + 'static> {
    stream: S,
}

impl<S, T> ReadableSource<T> for AsyncStreamSource<S>
where
    S: Stream<Item = T> + Unpin + Send + 'static,
    T: Send + 'static,
{
    async fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StreamResult<()> {
        if let Some(item) = self.stream.next().await {
            controller.enqueue(item)?;
        } else {
            controller.close()?;
        }
        Ok(())
    }
}

impl<T: Send + 'static> ReadableStream<T, Unlocked> {
    pub fn from_vec(vec: Vec<T>) -> ReadableStreamBuilder<T, IteratorSource<std::vec::IntoIter<T>>> {
        ReadableStreamBuilder::new(IteratorSource {
            iter: vec.into_iter(),
        })
    }

    pub fn from_iterator<I>(iter: I) -> ReadableStreamBuilder<T, IteratorSource<I>>
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        ReadableStreamBuilder::new(IteratorSource { iter })
    }

    pub fn from_stream<S>(stream: S) -> ReadableStreamBuilder<T, AsyncStreamSource<S>>
    where
        S: Stream<Item = T> + Unpin + Send + 'static,
    {
        ReadableStreamBuilder::new(AsyncStreamSource { stream })
    }
}

// ----------- Default reader -----------

/// Exclusive reading handle. Dropping it (or calling `release_lock`) frees
/// the stream for another reader.
pub struct ReadableStreamDefaultReader<T: Send + 'static> {
    stream: ReadableStream<T, Locked>,
    pending_read: Option<oneshot::Receiver<StreamResult<Option<T>>>>,
    terminated: bool,
    released: bool,
}

impl<T: Send + 'static> ReadableStreamDefaultReader<T> {
    fn new(stream: ReadableStream<T, Locked>) -> Self {
        Self {
            stream,
            pending_read: None,
            terminated: false,
            released: false,
        }
    }

    /// Read the next chunk: `Ok(Some(chunk))`, or `Ok(None)` once the stream
    /// is done. Reads issued before earlier ones settle are honored FIFO.
    pub async fn read(&self) -> StreamResult<Option<T>> {
        let (tx, rx) = oneshot::channel();
        self.stream
            .command_tx
            .unbounded_send(StreamCommand::Read { completion: tx })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    pub async fn cancel(&self, reason: Option<String>) -> StreamResult<()> {
        send_cancel(&self.stream.command_tx, reason).await
    }

    /// Settles once the stream closes; rejects with the stored error if it
    /// errors instead.
    pub async fn closed(&self) -> StreamResult<()> {
        poll_fn(|cx| {
            if self.stream.shared.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(self.stream.shared.stored_error()));
            }
            if self.stream.shared.closed.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            let register = self
                .stream
                .command_tx
                .unbounded_send(StreamCommand::RegisterClosedWaker {
                    waker: cx.waker().clone(),
                });
            if register.is_err() {
                return Poll::Ready(Err(StreamError::TaskDropped));
            }
            // Re-check after registering so a transition between the check
            // and the registration is not missed.
            if self.stream.shared.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(self.stream.shared.stored_error()));
            }
            if self.stream.shared.closed.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            Poll::Pending
        })
        .await
    }

    pub fn release_lock(mut self) -> ReadableStream<T, Unlocked> {
        self.released = true;
        self.stream.shared.locked.store(false, Ordering::SeqCst);
        self.stream.handle::<Unlocked>()
    }
}

impl<T: Send + 'static> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        if !self.released {
            self.stream.shared.locked.store(false, Ordering::SeqCst);
        }
    }
}

impl<T: Send + 'static> Stream for ReadableStreamDefaultReader<T> {
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        if this.pending_read.is_none() {
            let (tx, rx) = oneshot::channel();
            let sent = this
                .stream
                .command_tx
                .unbounded_send(StreamCommand::Read { completion: tx });
            if sent.is_err() {
                this.terminated = true;
                if this.stream.is_closed() {
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(Err(StreamError::TaskDropped)));
            }
            this.pending_read = Some(rx);
        }
        let Some(rx) = this.pending_read.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.pending_read = None;
                match result {
                    Ok(Ok(Some(value))) => Poll::Ready(Some(Ok(value))),
                    Ok(Ok(None)) => {
                        this.terminated = true;
                        Poll::Ready(None)
                    }
                    Ok(Err(error)) => {
                        this.terminated = true;
                        Poll::Ready(Some(Err(error)))
                    }
                    Err(_) => {
                        this.terminated = true;
                        if this.stream.is_closed() {
                            Poll::Ready(None)
                        } else {
                            Poll::Ready(Some(Err(StreamError::TaskDropped)))
                        }
                    }
                }
            }
        }
    }
}
