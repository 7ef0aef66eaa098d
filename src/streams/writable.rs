use std::{
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
    task::AtomicWaker,
    FutureExt, Sink, StreamExt,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{
    error::{StreamError, StreamResult},
    queue::{valid_size, SizedQueue},
    CountQueuingStrategy, Locked, QueuingStrategy, Unlocked, WakerSet,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    Writable,
    Erroring,
    Closed,
    Errored,
}

// ----------- Sink trait -----------

/// The caller-supplied consumer algorithms behind a writable stream.
///
/// `write` is required; `start`, `close` and `abort` default to no-ops.
/// `close` consumes the sink: once the close algorithm has started no other
/// algorithm can run.
pub trait WritableSink<T: Send + 'static>: Send + Sized + 'static {
    fn start(
        &mut self,
        controller: &WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + Send {
        let _ = controller;
        async { Ok(()) }
    }

    fn write(
        &mut self,
        chunk: T,
        controller: &WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + Send;

    fn close(self) -> impl Future<Output = StreamResult<()>> + Send {
        async { Ok(()) }
    }

    fn abort(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> + Send {
        let _ = reason;
        async { Ok(()) }
    }
}

// ----------- Commands and controller messages -----------

struct PendingWrite<T> {
    chunk: T,
    completion: oneshot::Sender<StreamResult<()>>,
}

enum StreamCommand<T> {
    Write {
        chunk: T,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Close {
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Abort {
        reason: Option<String>,
        completion: oneshot::Sender<StreamResult<()>>,
    },
    Flush {
        completion: oneshot::Sender<StreamResult<()>>,
    },
    RegisterReadyWaker {
        waker: std::task::Waker,
    },
    RegisterClosedWaker {
        waker: std::task::Waker,
    },
}

enum ControllerMsg {
    Error(StreamError),
}

// ----------- Shared observable state -----------

struct SharedWritableState {
    queue_total_size: AtomicU64,
    high_water_mark: f64,
    backpressure: AtomicBool,
    closed: AtomicBool,
    errored: AtomicBool,
    erroring: AtomicBool,
    close_requested: AtomicBool,
    locked: AtomicBool,
    stored_error: Mutex<Option<StreamError>>,
}

impl SharedWritableState {
    fn new(high_water_mark: f64) -> Self {
        Self {
            queue_total_size: AtomicU64::new(0f64.to_bits()),
            high_water_mark,
            backpressure: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            erroring: AtomicBool::new(false),
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

/// Handle passed to the sink algorithms.
///
/// Besides signalling errors, it carries the abort flag a long-running write
/// can watch (`is_aborted()` / `aborted().await`) to stop early once the
/// stream is being torn down.
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    tx: UnboundedSender<ControllerMsg>,
    abort_requested: Arc<AtomicBool>,
    abort_waker: Arc<AtomicWaker>,
}

impl WritableStreamDefaultController {
    fn new(tx: UnboundedSender<ControllerMsg>) -> Self {
        Self {
            tx,
            abort_requested: Arc::new(AtomicBool::new(false)),
            abort_waker: Arc::new(AtomicWaker::new()),
        }
    }

    /// Signal an error on the stream.
    pub fn error(&self, error: StreamError) {
        let _ = self.tx.unbounded_send(ControllerMsg::Error(error));
    }

    /// Synchronous check of the abort flag.
    pub fn is_aborted(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Resolves once an abort has been requested. Write algorithms can
    /// `select!` on this next to their real work.
    pub fn aborted(&self) -> impl Future<Output = ()> + '_ {
        poll_fn(move |cx| {
            if self.abort_requested.load(Ordering::SeqCst) {
                return Poll::Ready(());
            }
            self.abort_waker.register(cx.waker());
            if self.abort_requested.load(Ordering::SeqCst) {
                return Poll::Ready(());
            }
            Poll::Pending
        })
    }

    fn request_abort(&self) {
        self.abort_requested.store(true, Ordering::SeqCst);
        self.abort_waker.wake();
    }
}

// ----------- Driver-side state -----------

struct PendingAbort {
    reason: Option<String>,
    completions: Vec<oneshot::Sender<StreamResult<()>>>,
}

struct WritableStreamInner<T> {
    state: WritableState,
    queue: SizedQueue<PendingWrite<T>>,
    in_flight_size: f64,
    strategy: Box<dyn QueuingStrategy<T> + Send>,
    backpressure: bool,
    close_requested: bool,
    close_completions: Vec<oneshot::Sender<StreamResult<()>>>,
    pending_abort: Option<PendingAbort>,
    stored_error: Option<StreamError>,
    flush_waiters: Vec<(oneshot::Sender<StreamResult<()>>, usize)>,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
    shared: Arc<SharedWritableState>,
}

impl<T: Send + 'static> WritableStreamInner<T> {
    fn new(strategy: Box<dyn QueuingStrategy<T> + Send>, shared: Arc<SharedWritableState>) -> Self {
        Self {
            state: WritableState::Writable,
            queue: SizedQueue::new(),
            in_flight_size: 0.0,
            strategy,
            backpressure: false,
            close_requested: false,
            close_completions: Vec::new(),
            pending_abort: None,
            stored_error: None,
            flush_waiters: Vec::new(),
            ready_wakers: WakerSet::new(),
            closed_wakers: WakerSet::new(),
            shared,
        }
    }

    fn stored_error(&self) -> StreamError {
        self.stored_error
            .clone()
            .unwrap_or(StreamError::State("stream is errored"))
    }

    /// Queued plus in-flight size; an element keeps counting until its write
    /// settles.
    fn total_size(&self) -> f64 {
        self.queue.total_size() + self.in_flight_size
    }

    fn sync_totals(&self) {
        self.shared.set_total_size(self.total_size());
    }

    fn update_backpressure(&mut self) {
        let prev = self.backpressure;
        self.backpressure = self.total_size() > self.shared.high_water_mark;
        self.shared
            .backpressure
            .store(self.backpressure, Ordering::SeqCst);
        if prev && !self.backpressure {
            self.ready_wakers.wake_all();
        }
    }

    /// First detected failure wins; later ones are ignored.
    fn deal_with_rejection(&mut self, error: StreamError) {
        match self.state {
            WritableState::Writable => self.start_erroring(error),
            WritableState::Erroring | WritableState::Closed | WritableState::Errored => {}
        }
    }

    /// Writable -> Erroring: store the reason and reject everything that is
    /// not already in flight.
    fn start_erroring(&mut self, reason: StreamError) {
        debug!(error = %reason, "writable stream erroring");
        self.state = WritableState::Erroring;
        self.stored_error = Some(reason.clone());
        self.shared.set_stored_error(reason.clone());
        self.shared.erroring.store(true, Ordering::SeqCst);
        while let Some(element) = self.queue.dequeue() {
            let _ = element.value.completion.send(Err(reason.clone()));
        }
        self.sync_totals();
        self.ready_wakers.wake_all();
    }

    /// Close algorithm succeeded.
    fn finish_close(&mut self) {
        trace!("writable stream closed");
        self.state = WritableState::Closed;
        self.shared.closed.store(true, Ordering::SeqCst);
        for completion in self.close_completions.drain(..) {
            let _ = completion.send(Ok(()));
        }
        for (completion, _) in self.flush_waiters.drain(..) {
            let _ = completion.send(Ok(()));
        }
        self.closed_wakers.wake_all();
        self.ready_wakers.wake_all();
    }

    fn decrement_flush_counters(&mut self) {
        let mut i = 0;
        while i < self.flush_waiters.len() {
            self.flush_waiters[i].1 -= 1;
            if self.flush_waiters[i].1 == 0 {
                let (completion, _) = self.flush_waiters.swap_remove(i);
                let _ = completion.send(Ok(()));
            } else {
                i += 1;
            }
        }
    }

    fn process_controller_msg(&mut self, msg: ControllerMsg) {
        match msg {
            ControllerMsg::Error(error) => self.deal_with_rejection(error),
        }
    }

    fn process_command(
        &mut self,
        cmd: StreamCommand<T>,
        write_in_flight: bool,
        controller: &WritableStreamDefaultController,
    ) {
        match cmd {
            StreamCommand::Write { chunk, completion } => {
                match self.state {
                    WritableState::Errored | WritableState::Erroring => {
                        let _ = completion.send(Err(self.stored_error()));
                        return;
                    }
                    WritableState::Closed => {
                        let _ = completion.send(Err(StreamError::Closed));
                        return;
                    }
                    WritableState::Writable => {}
                }
                if self.close_requested {
                    let _ = completion.send(Err(StreamError::Closing));
                    return;
                }
                let size = self.strategy.size(&chunk);
                if let Err(error) = valid_size(size) {
                    // Failing size algorithm: reject this write and error the
                    // stream with the same error.
                    let _ = completion.send(Err(error.clone()));
                    self.start_erroring(error);
                    return;
                }
                self.queue.push(PendingWrite { chunk, completion }, size);
                self.sync_totals();
                self.update_backpressure();
            }
            StreamCommand::Close { completion } => {
                match self.state {
                    WritableState::Errored | WritableState::Erroring => {
                        let _ = completion.send(Err(self.stored_error()));
                        return;
                    }
                    WritableState::Closed => {
                        let _ = completion.send(Err(StreamError::Closed));
                        return;
                    }
                    WritableState::Writable => {}
                }
                if self.close_requested {
                    let _ = completion.send(Err(StreamError::Closing));
                    return;
                }
                trace!("writable stream close requested");
                self.close_requested = true;
                self.shared.close_requested.store(true, Ordering::SeqCst);
                self.close_completions.push(completion);
                // The writer is no longer "ready" once closing starts.
                self.ready_wakers.wake_all();
            }
            StreamCommand::Abort { reason, completion } => {
                match self.state {
                    WritableState::Closed | WritableState::Errored => {
                        let _ = completion.send(Ok(()));
                        return;
                    }
                    WritableState::Writable | WritableState::Erroring => {}
                }
                if let Some(pending) = self.pending_abort.as_mut() {
                    pending.completions.push(completion);
                    return;
                }
                trace!(?reason, "writable stream abort requested");
                self.pending_abort = Some(PendingAbort {
                    reason: reason.clone(),
                    completions: vec![completion],
                });
                controller.request_abort();
                if self.state == WritableState::Writable {
                    self.start_erroring(StreamError::Aborted(reason));
                }
            }
            StreamCommand::Flush { completion } => {
                if matches!(self.state, WritableState::Errored | WritableState::Erroring) {
                    let _ = completion.send(Err(self.stored_error()));
                    return;
                }
                let outstanding = self.queue.len() + usize::from(write_in_flight);
                if outstanding == 0 {
                    let _ = completion.send(Ok(()));
                } else {
                    self.flush_waiters.push((completion, outstanding));
                }
            }
            StreamCommand::RegisterReadyWaker { waker } => {
                self.ready_wakers.register(&waker);
                if !self.backpressure || self.state != WritableState::Writable {
                    self.ready_wakers.wake_all();
                }
            }
            StreamCommand::RegisterClosedWaker { waker } => {
                self.closed_wakers.register(&waker);
                if matches!(self.state, WritableState::Closed | WritableState::Errored) {
                    self.closed_wakers.wake_all();
                }
            }
        }
    }
}

/// Erroring -> Errored. Runs the abort algorithm if (and only if) an abort
/// was explicitly requested and the sink is still around.
async fn finish_erroring<T, SinkType>(
    inner: &mut WritableStreamInner<T>,
    sink_slot: &mut Option<SinkType>,
) where
    T: Send + 'static,
    SinkType: WritableSink<T>,
{
    debug!("writable stream errored");
    inner.state = WritableState::Errored;
    inner.shared.errored.store(true, Ordering::SeqCst);
    inner.shared.erroring.store(false, Ordering::SeqCst);
    let stored = inner.stored_error();
    for completion in inner.close_completions.drain(..) {
        let _ = completion.send(Err(stored.clone()));
    }
    for (completion, _) in inner.flush_waiters.drain(..) {
        let _ = completion.send(Err(stored.clone()));
    }
    inner.closed_wakers.wake_all();
    inner.ready_wakers.wake_all();

    if let Some(pending) = inner.pending_abort.take() {
        match sink_slot.take() {
            Some(mut sink) => {
                trace!("running abort algorithm");
                let result = sink.abort(pending.reason).await;
                for completion in pending.completions {
                    let _ = completion.send(result.clone());
                }
            }
            None => {
                // The close algorithm already consumed the sink; the abort
                // settles from the stored failure instead.
                for completion in pending.completions {
                    let _ = completion.send(Err(stored.clone()));
                }
            }
        }
    }
    *sink_slot = None;
}

// ----------- Driver task -----------

async fn writable_stream_task<T, SinkType>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg>,
    mut inner: WritableStreamInner<T>,
    controller: WritableStreamDefaultController,
    sink: SinkType,
) where
    T: Send + 'static,
    SinkType: WritableSink<T>,
{
    let mut sink_slot = Some(sink);
    let mut commands_done = false;

    // Run start to settlement before accepting work.
    if let Some(sink) = sink_slot.as_mut() {
        if let Err(error) = sink.start(&controller).await {
            inner.start_erroring(error);
        }
    }

    loop {
        while let Ok(Some(msg)) = ctrl_rx.try_next() {
            inner.process_controller_msg(msg);
        }
        while let Ok(Some(cmd)) = command_rx.try_next() {
            inner.process_command(cmd, false, &controller);
        }

        if inner.state == WritableState::Erroring {
            finish_erroring(&mut inner, &mut sink_slot).await;
            continue;
        }

        if inner.state == WritableState::Writable && !inner.queue.is_empty() {
            if let Some(mut sink) = sink_slot.take() {
                let Some(element) = inner.queue.dequeue() else {
                    sink_slot = Some(sink);
                    continue;
                };
                inner.in_flight_size = element.size;
                inner.sync_totals();
                let PendingWrite { chunk, completion } = element.value;

                // One write-algorithm call in flight at a time; commands keep
                // being serviced while it runs.
                let result = {
                    let write_fut = sink.write(chunk, &controller).fuse();
                    pin_mut!(write_fut);
                    loop {
                        select! {
                            result = write_fut => break result,
                            msg = ctrl_rx.next() => {
                                if let Some(msg) = msg {
                                    inner.process_controller_msg(msg);
                                }
                            }
                            cmd = command_rx.next() => {
                                match cmd {
                                    Some(cmd) => inner.process_command(cmd, true, &controller),
                                    None => commands_done = true,
                                }
                            }
                        }
                    }
                };
                sink_slot = Some(sink);
                inner.in_flight_size = 0.0;
                inner.sync_totals();
                inner.update_backpressure();
                match result {
                    Ok(()) => {
                        inner.decrement_flush_counters();
                        let _ = completion.send(Ok(()));
                    }
                    Err(error) => {
                        let _ = completion.send(Err(error.clone()));
                        inner.deal_with_rejection(error);
                    }
                }
                continue;
            }
        }

        if inner.state == WritableState::Writable && inner.close_requested && inner.queue.is_empty()
        {
            match sink_slot.take() {
                Some(sink) => {
                    trace!("running close algorithm");
                    match sink.close().await {
                        Ok(()) => inner.finish_close(),
                        Err(error) => inner.deal_with_rejection(error),
                    }
                }
                None => inner.finish_close(),
            }
            continue;
        }

        if matches!(inner.state, WritableState::Closed | WritableState::Errored) {
            sink_slot = None;
        }

        if commands_done {
            return;
        }

        select! {
            msg = ctrl_rx.next() => {
                if let Some(msg) = msg {
                    inner.process_controller_msg(msg);
                }
            }
            cmd = command_rx.next() => {
                match cmd {
                    Some(cmd) => inner.process_command(cmd, false, &controller),
                    None => commands_done = true,
                }
            }
        }
    }
}

// ----------- Public stream handle -----------

/// A writable stream handle. The consumer algorithms live in the driver
/// future returned at construction; this handle (and the writer locked from
/// it) talk to that driver over channels.
pub struct WritableStream<T: Send + 'static, LockState = Unlocked> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    shared: Arc<SharedWritableState>,
    _lock: PhantomData<LockState>,
}

impl<T: Send + 'static, LockState> WritableStream<T, LockState> {
    fn handle<L>(&self) -> WritableStream<T, L> {
        WritableStream {
            command_tx: self.command_tx.clone(),
            shared: Arc::clone(&self.shared),
            _lock: PhantomData,
        }
    }

    pub fn locked(&self) -> bool {
        self.shared.locked.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WritableState {
        let shared = &self.shared;
        if shared.errored.load(Ordering::SeqCst) {
            WritableState::Errored
        } else if shared.erroring.load(Ordering::SeqCst) {
            WritableState::Erroring
        } else if shared.closed.load(Ordering::SeqCst) {
            WritableState::Closed
        } else {
            WritableState::Writable
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn is_errored(&self) -> bool {
        self.shared.errored.load(Ordering::SeqCst)
    }
}

impl<T: Send + 'static> WritableStream<T, Unlocked> {
    pub(crate) fn new_inner<SinkType>(
        sink: SinkType,
        strategy: Box<dyn QueuingStrategy<T> + Send>,
    ) -> (Self, impl Future<Output = ()> + Send)
    where
        SinkType: WritableSink<T>,
    {
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let shared = Arc::new(SharedWritableState::new(strategy.high_water_mark()));
        let controller = WritableStreamDefaultController::new(ctrl_tx);
        let inner = WritableStreamInner::new(strategy, Arc::clone(&shared));
        let task = writable_stream_task(command_rx, ctrl_rx, inner, controller, sink);

        let stream = Self {
            command_tx,
            shared,
            _lock: PhantomData,
        };
        (stream, task)
    }

    /// Acquire the stream's single writer. Fails with `Locked` if one is
    /// already live.
    pub fn get_writer(
        &self,
    ) -> StreamResult<(WritableStream<T, Locked>, WritableStreamDefaultWriter<T>)> {
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
            WritableStreamDefaultWriter::new(self.handle::<Locked>()),
        ))
    }

    /// Close the stream. Fails with `Locked` while a writer is live.
    pub async fn close(&self) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        send_close(&self.command_tx).await
    }

    /// Abort the stream. Fails with `Locked` while a writer is live.
    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        if self.locked() {
            return Err(StreamError::Locked);
        }
        send_abort(&self.command_tx, reason).await
    }

    pub fn builder<SinkType>(sink: SinkType) -> WritableStreamBuilder<T, SinkType>
    where
        SinkType: WritableSink<T>,
    {
        WritableStreamBuilder::new(sink)
    }
}

async fn send_close<T: Send + 'static>(
    command_tx: &UnboundedSender<StreamCommand<T>>,
) -> StreamResult<()> {
    let (tx, rx) = oneshot::channel();
    command_tx
        .unbounded_send(StreamCommand::Close { completion: tx })
        .map_err(|_| StreamError::TaskDropped)?;
    rx.await.unwrap_or(Err(StreamError::TaskDropped))
}

async fn send_abort<T: Send + 'static>(
    command_tx: &UnboundedSender<StreamCommand<T>>,
    reason: Option<String>,
) -> StreamResult<()> {
    let (tx, rx) = oneshot::channel();
    command_tx
        .unbounded_send(StreamCommand::Abort {
            reason,
            completion: tx,
        })
        .map_err(|_| StreamError::TaskDropped)?;
    rx.await.unwrap_or(Err(StreamError::TaskDropped))
}

// ----------- Builder -----------

pub struct WritableStreamBuilder<T: Send + 'static, SinkType> {
    sink: SinkType,
    strategy: Box<dyn QueuingStrategy<T> + Send>,
}

impl<T, SinkType> WritableStreamBuilder<T, SinkType>
where
    T: Send + 'static,
    SinkType: WritableSink<T>,
{
    fn new(sink: SinkType) -> Self {
        Self {
            sink,
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
    ) -> StreamResult<(WritableStream<T, Unlocked>, impl Future<Output = ()> + Send)> {
        super::validate_high_water_mark(self.strategy.high_water_mark())?;
        Ok(WritableStream::new_inner(self.sink, self.strategy))
    }

    /// Hand the driver future to a spawner and return the stream.
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T, Unlocked>>
    where
        F: FnOnce(BoxFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}

// ----------- Default writer -----------

/// Exclusive writing handle. Dropping it (or calling `release_lock`) frees
/// the stream for another writer.
pub struct WritableStreamDefaultWriter<T: Send + 'static> {
    stream: WritableStream<T, Locked>,
    flush_rx: Option<oneshot::Receiver<StreamResult<()>>>,
    close_rx: Option<oneshot::Receiver<StreamResult<()>>>,
    released: bool,
}

impl<T: Send + 'static> WritableStreamDefaultWriter<T> {
    fn new(stream: WritableStream<T, Locked>) -> Self {
        Self {
            stream,
            flush_rx: None,
            close_rx: None,
            released: false,
        }
    }

    /// Queue a chunk. The returned future settles once this write has been
    /// flushed to the sink, in issue order; it rejects if the stream errors
    /// first. The chunk itself is queued synchronously, so calling this
    /// without awaiting (respecting `ready()`) is the fire-and-forget mode.
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .stream
            .command_tx
            .unbounded_send(StreamCommand::Write {
                chunk,
                completion: tx,
            })
            .map_err(|_| StreamError::TaskDropped);
        async move {
            sent?;
            rx.await.unwrap_or(Err(StreamError::TaskDropped))
        }
    }

    /// Queue a chunk without any completion tracking.
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        if self.stream.shared.errored.load(Ordering::SeqCst)
            || self.stream.shared.erroring.load(Ordering::SeqCst)
        {
            return Err(self.stream.shared.stored_error());
        }
        if self.stream.shared.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        let (tx, _rx) = oneshot::channel();
        self.stream
            .command_tx
            .unbounded_send(StreamCommand::Write {
                chunk,
                completion: tx,
            })
            .map_err(|_| StreamError::TaskDropped)
    }

    /// Close the stream once every queued write has been flushed.
    pub async fn close(&self) -> StreamResult<()> {
        send_close(&self.stream.command_tx).await
    }

    pub async fn abort(&self, reason: Option<String>) -> StreamResult<()> {
        send_abort(&self.stream.command_tx, reason).await
    }

    /// Settles once every write queued so far has been flushed.
    pub async fn flush(&self) -> StreamResult<()> {
        let (tx, rx) = oneshot::channel();
        self.stream
            .command_tx
            .unbounded_send(StreamCommand::Flush { completion: tx })
            .map_err(|_| StreamError::TaskDropped)?;
        rx.await.unwrap_or(Err(StreamError::TaskDropped))
    }

    /// `None` once the stream is closed, erroring or errored.
    pub fn desired_size(&self) -> Option<f64> {
        let shared = &self.stream.shared;
        if shared.closed.load(Ordering::SeqCst)
            || shared.errored.load(Ordering::SeqCst)
            || shared.erroring.load(Ordering::SeqCst)
        {
            return None;
        }
        Some(shared.high_water_mark - shared.total_size())
    }

    /// Pending while backpressure holds; resolves once the queued-plus-in-
    /// flight size drops to or under the high water mark; rejects once the
    /// stream stops being writable.
    pub fn ready(&self) -> impl Future<Output = StreamResult<()>> + '_ {
        poll_fn(move |cx| self.poll_ready_inner(cx))
    }

    fn poll_ready_inner(&self, cx: &mut Context<'_>) -> Poll<StreamResult<()>> {
        let shared = &self.stream.shared;
        if let Some(err) = self.terminal_error() {
            return Poll::Ready(Err(err));
        }
        if !shared.backpressure.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        let register = self
            .stream
            .command_tx
            .unbounded_send(StreamCommand::RegisterReadyWaker {
                waker: cx.waker().clone(),
            });
        if register.is_err() {
            return Poll::Ready(Err(StreamError::TaskDropped));
        }
        // Re-check after registering so a transition between the check and
        // the registration is not missed.
        if let Some(err) = self.terminal_error() {
            return Poll::Ready(Err(err));
        }
        if !shared.backpressure.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        Poll::Pending
    }

    fn terminal_error(&self) -> Option<StreamError> {
        let shared = &self.stream.shared;
        if shared.errored.load(Ordering::SeqCst) || shared.erroring.load(Ordering::SeqCst) {
            return Some(shared.stored_error());
        }
        if shared.closed.load(Ordering::SeqCst) {
            return Some(StreamError::Closed);
        }
        if shared.close_requested.load(Ordering::SeqCst) {
            return Some(StreamError::Closing);
        }
        None
    }

    /// Settles once the stream closes; rejects with the stored error if it
    /// errors instead.
    pub async fn closed(&self) -> StreamResult<()> {
        poll_fn(|cx| {
            let shared = &self.stream.shared;
            if shared.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(shared.stored_error()));
            }
            if shared.closed.load(Ordering::SeqCst) {
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
            if shared.errored.load(Ordering::SeqCst) {
                return Poll::Ready(Err(shared.stored_error()));
            }
            if shared.closed.load(Ordering::SeqCst) {
                return Poll::Ready(Ok(()));
            }
            Poll::Pending
        })
        .await
    }

    pub fn release_lock(mut self) -> WritableStream<T, Unlocked> {
        self.released = true;
        self.stream.shared.locked.store(false, Ordering::SeqCst);
        self.stream.handle::<Unlocked>()
    }
}

impl<T: Send + 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        if !self.released {
            self.stream.shared.locked.store(false, Ordering::SeqCst);
        }
    }
}

impl<T: Send + 'static> Sink<T> for WritableStreamDefaultWriter<T> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.get_mut().poll_ready_inner(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        self.get_mut().enqueue(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if this.flush_rx.is_none() {
            let (tx, rx) = oneshot::channel();
            let sent = this
                .stream
                .command_tx
                .unbounded_send(StreamCommand::Flush { completion: tx });
            if sent.is_err() {
                return Poll::Ready(Err(StreamError::TaskDropped));
            }
            this.flush_rx = Some(rx);
        }
        let Some(rx) = this.flush_rx.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.flush_rx = None;
                Poll::Ready(result.unwrap_or(Err(StreamError::TaskDropped)))
            }
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.get_mut();
        if this.stream.is_closed() && this.close_rx.is_none() {
            return Poll::Ready(Ok(()));
        }
        if this.close_rx.is_none() {
            let (tx, rx) = oneshot::channel();
            let sent = this
                .stream
                .command_tx
                .unbounded_send(StreamCommand::Close { completion: tx });
            if sent.is_err() {
                return Poll::Ready(Err(StreamError::TaskDropped));
            }
            this.close_rx = Some(rx);
        }
        let Some(rx) = this.close_rx.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match Pin::new(rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(result) => {
                this.close_rx = None;
                Poll::Ready(result.unwrap_or(Err(StreamError::TaskDropped)))
            }
        }
    }
}
