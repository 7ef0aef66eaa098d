use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Poll, Waker},
};

use futures::{
    channel::{
        mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    future::{poll_fn, BoxFuture},
    pin_mut, select, FutureExt, StreamExt,
};
use parking_lot::Mutex;
use tracing::trace;

use super::{
    error::{StreamError, StreamResult},
    readable::{
        ReadableSource, ReadableStream, ReadableStreamDefaultController,
        ReadableStreamDefaultReader,
    },
    CountQueuingStrategy, QueuingStrategy, Unlocked,
};

/// One-slot wakeup flag used between the tee branches and the coordinator.
#[derive(Clone, Default)]
struct AsyncSignal {
    waker: Arc<Mutex<Option<Waker>>>,
    signaled: Arc<AtomicBool>,
}

impl AsyncSignal {
    fn new() -> Self {
        Self::default()
    }

    async fn wait(&self) {
        poll_fn(|cx| {
            if self.signaled.swap(false, Ordering::SeqCst) {
                return Poll::Ready(());
            }
            *self.waker.lock() = Some(cx.waker().clone());
            // Re-check: a signal may have fired before the waker was parked.
            if self.signaled.swap(false, Ordering::SeqCst) {
                return Poll::Ready(());
            }
            Poll::Pending
        })
        .await
    }

    fn signal(&self) {
        self.signaled.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.lock().take() {
            waker.wake();
        }
    }
}

enum TeeMessage<T> {
    Chunk(T),
    Done,
    Failed(StreamError),
}

#[derive(Clone, Copy)]
enum TeeBranch {
    First,
    Second,
}

#[derive(Default)]
struct TeeCancelSlots {
    first: Option<Option<String>>,
    second: Option<Option<String>>,
}

struct TeeCancelRequest {
    reason: Option<String>,
    completion: oneshot::Sender<StreamResult<()>>,
}

/// Source feeding one tee branch from the coordinator's fan-out channel.
struct TeeBranchSource<T: Send + 'static> {
    chunk_rx: UnboundedReceiver<TeeMessage<T>>,
    branch: TeeBranch,
    demand: AsyncSignal,
    cancel_tx: UnboundedSender<TeeCancelRequest>,
    slots: Arc<Mutex<TeeCancelSlots>>,
}

impl<T: Send + 'static> ReadableSource<T> for TeeBranchSource<T> {
    async fn pull(&mut self, controller: &ReadableStreamDefaultController<T>) -> StreamResult<()> {
        self.demand.signal();
        match self.chunk_rx.next().await {
            Some(TeeMessage::Chunk(value)) => controller.enqueue(value)?,
            Some(TeeMessage::Done) | None => controller.close()?,
            Some(TeeMessage::Failed(error)) => return Err(error),
        }
        Ok(())
    }

    async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
        let combined = {
            let mut slots = self.slots.lock();
            match self.branch {
                TeeBranch::First => slots.first = Some(reason),
                TeeBranch::Second => slots.second = Some(reason),
            }
            match (&slots.first, &slots.second) {
                // Only once both branches are canceled does the underlying
                // stream get canceled, with the combined reasons.
                (Some(first), Some(second)) => Some(combine_reasons(first, second)),
                _ => None,
            }
        };
        match combined {
            Some(reason) => {
                let (tx, rx) = oneshot::channel();
                let sent = self.cancel_tx.unbounded_send(TeeCancelRequest {
                    reason: Some(reason),
                    completion: tx,
                });
                if sent.is_err() {
                    // Coordinator already finished; the underlying stream is
                    // closed or errored and needs no cancel.
                    return Ok(());
                }
                rx.await.unwrap_or(Ok(()))
            }
            None => Ok(()),
        }
    }
}

fn combine_reasons(first: &Option<String>, second: &Option<String>) -> String {
    let render = |reason: &Option<String>| reason.clone().unwrap_or_else(|| "(none)".to_string());
    format!("[{}, {}]", render(first), render(second))
}

struct TeeCoordinator<T: Send + Clone + 'static> {
    reader: ReadableStreamDefaultReader<T>,
    first_tx: UnboundedSender<TeeMessage<T>>,
    second_tx: UnboundedSender<TeeMessage<T>>,
    demand: AsyncSignal,
    cancel_rx: UnboundedReceiver<TeeCancelRequest>,
}

impl<T: Send + Clone + 'static> TeeCoordinator<T> {
    async fn run(mut self) {
        loop {
            // Wait until a branch asks for data; a combined cancel or both
            // branches disappearing ends the loop.
            {
                let demand_fut = self.demand.wait().fuse();
                pin_mut!(demand_fut);
                select! {
                    _ = demand_fut => {}
                    request = self.cancel_rx.next() => {
                        match request {
                            Some(request) => {
                                Self::cancel_underlying(&self.reader, request).await;
                            }
                            None => {}
                        }
                        return;
                    }
                }
            }

            if self.first_tx.is_closed() && self.second_tx.is_closed() {
                // A combined cancel may have raced in just before the second
                // branch went away; it still owns the underlying cancel.
                if let Ok(Some(request)) = self.cancel_rx.try_next() {
                    Self::cancel_underlying(&self.reader, request).await;
                }
                return;
            }

            // Read one chunk, still responsive to a combined cancel.
            let result = {
                let read_fut = self.reader.read().fuse();
                pin_mut!(read_fut);
                select! {
                    result = read_fut => result,
                    request = self.cancel_rx.next() => {
                        match request {
                            Some(request) => {
                                Self::cancel_underlying(&self.reader, request).await;
                            }
                            None => {}
                        }
                        return;
                    }
                }
            };

            match result {
                Ok(Some(chunk)) => {
                    // Fan out to both branches; a dead branch just ignores.
                    let _ = self.first_tx.unbounded_send(TeeMessage::Chunk(chunk.clone()));
                    let _ = self.second_tx.unbounded_send(TeeMessage::Chunk(chunk));
                }
                Ok(None) => {
                    trace!("tee: underlying stream done, closing both branches");
                    let _ = self.first_tx.unbounded_send(TeeMessage::Done);
                    let _ = self.second_tx.unbounded_send(TeeMessage::Done);
                    return;
                }
                Err(error) => {
                    trace!(error = %error, "tee: underlying stream errored, failing both branches");
                    let _ = self
                        .first_tx
                        .unbounded_send(TeeMessage::Failed(error.clone()));
                    let _ = self.second_tx.unbounded_send(TeeMessage::Failed(error));
                    return;
                }
            }
        }
    }

    async fn cancel_underlying(reader: &ReadableStreamDefaultReader<T>, request: TeeCancelRequest) {
        trace!(reason = ?request.reason, "tee: both branches canceled, canceling underlying stream");
        let result = reader.cancel(request.reason).await;
        let _ = request.completion.send(result);
    }
}

/// Configures and starts a tee split; obtained from [`ReadableStream::tee`].
pub struct TeeBuilder<T: Send + Clone + 'static> {
    stream: ReadableStream<T, Unlocked>,
    first_strategy: Box<dyn QueuingStrategy<T> + Send>,
    second_strategy: Box<dyn QueuingStrategy<T> + Send>,
}

impl<T: Send + Clone + 'static> TeeBuilder<T> {
    fn new(stream: ReadableStream<T, Unlocked>) -> Self {
        Self {
            stream,
            first_strategy: Box::new(CountQueuingStrategy::new(1.0)),
            second_strategy: Box::new(CountQueuingStrategy::new(1.0)),
        }
    }

    pub fn branch1_strategy<S: QueuingStrategy<T> + 'static>(mut self, strategy: S) -> Self {
        self.first_strategy = Box::new(strategy);
        self
    }

    pub fn branch2_strategy<S: QueuingStrategy<T> + 'static>(mut self, strategy: S) -> Self {
        self.second_strategy = Box::new(strategy);
        self
    }

    /// The same strategy for both branches.
    pub fn strategy<S: QueuingStrategy<T> + Clone + 'static>(mut self, strategy: S) -> Self {
        self.first_strategy = Box::new(strategy.clone());
        self.second_strategy = Box::new(strategy);
        self
    }

    /// Lock the stream and build both branches plus the three driver futures
    /// (coordinator, branch 1, branch 2), unspawned.
    #[allow(clippy::type_complexity)]
    pub fn prepare(
        self,
    ) -> StreamResult<(
        ReadableStream<T, Unlocked>,
        ReadableStream<T, Unlocked>,
        impl Future<Output = ()> + Send,
        impl Future<Output = ()> + Send,
        impl Future<Output = ()> + Send,
    )> {
        super::validate_high_water_mark(self.first_strategy.high_water_mark())?;
        super::validate_high_water_mark(self.second_strategy.high_water_mark())?;
        let (_locked, reader) = self.stream.get_reader()?;

        let (first_tx, first_rx) = unbounded();
        let (second_tx, second_rx) = unbounded();
        let (cancel_tx, cancel_rx) = unbounded();
        let demand = AsyncSignal::new();
        let slots = Arc::new(Mutex::new(TeeCancelSlots::default()));

        let first_source = TeeBranchSource {
            chunk_rx: first_rx,
            branch: TeeBranch::First,
            demand: demand.clone(),
            cancel_tx: cancel_tx.clone(),
            slots: Arc::clone(&slots),
        };
        let second_source = TeeBranchSource {
            chunk_rx: second_rx,
            branch: TeeBranch::Second,
            demand: demand.clone(),
            cancel_tx,
            slots,
        };

        let (first_stream, first_fut) =
            ReadableStream::new_inner(first_source, self.first_strategy);
        let (second_stream, second_fut) =
            ReadableStream::new_inner(second_source, self.second_strategy);

        let coordinator = TeeCoordinator {
            reader,
            first_tx,
            second_tx,
            demand,
            cancel_rx,
        };

        Ok((
            first_stream,
            second_stream,
            coordinator.run(),
            first_fut,
            second_fut,
        ))
    }

    /// Spawn all three drivers bundled into one future.
    pub fn spawn<F, R>(
        self,
        spawn_fn: F,
    ) -> StreamResult<(ReadableStream<T, Unlocked>, ReadableStream<T, Unlocked>)>
    where
        F: FnOnce(BoxFuture<'static, ()>) -> R,
    {
        let (first, second, coordinator_fut, first_fut, second_fut) = self.prepare()?;
        spawn_fn(Box::pin(async move {
            futures::join!(coordinator_fut, first_fut, second_fut);
        }));
        Ok((first, second))
    }
}

impl<T: Send + Clone + 'static> ReadableStream<T, Unlocked> {
    /// Fork this stream into two independently cancelable branches sharing a
    /// single underlying reader.
    pub fn tee(self) -> TeeBuilder<T> {
        TeeBuilder::new(self)
    }
}
