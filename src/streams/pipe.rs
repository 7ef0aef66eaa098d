use std::future::Future;

use futures::future::{AbortRegistration, Abortable, Aborted, BoxFuture};
use tracing::trace;

use super::{
    error::{StreamError, StreamResult},
    readable::ReadableStream,
    writable::WritableStream,
    Unlocked,
};

/// Options for [`ReadableStream::pipe_to`] / [`ReadableStream::pipe_through`].
///
/// The `prevent_*` flags suppress the corresponding shutdown action;
/// `signal` aborts the whole pipe from outside.
#[derive(Default)]
pub struct PipeOptions {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    pub signal: Option<AbortRegistration>,
}

impl<T: Send + 'static> ReadableStream<T, Unlocked> {
    /// Drive every chunk of this stream into `destination`.
    ///
    /// The pump waits for destination readiness before each read, so the
    /// destination's high water mark throttles the source. Exactly one
    /// shutdown sequence ever runs:
    ///
    /// - source done: close destination (unless `prevent_close`), resolve
    /// - source error: abort destination (unless `prevent_abort`), reject
    /// - destination error: cancel source (unless `prevent_cancel`), reject
    /// - destination closed: cancel source (unless `prevent_cancel`), reject
    /// - signal fired: cancel source and abort destination, reject
    pub async fn pipe_to(
        self,
        destination: &WritableStream<T, Unlocked>,
        options: Option<PipeOptions>,
    ) -> StreamResult<()> {
        let options = options.unwrap_or_default();
        let PipeOptions {
            prevent_close,
            prevent_abort,
            prevent_cancel,
            signal,
        } = options;

        let (_dest_locked, writer) = destination.get_writer()?;
        let (_src_locked, reader) = self.get_reader()?;

        let pipe_loop = async {
            loop {
                // Destination readiness gates the next read.
                if let Err(ready_err) = writer.ready().await {
                    let error = match ready_err {
                        // Closed out from under the pipe rather than errored.
                        StreamError::Closed | StreamError::Closing => {
                            StreamError::DestinationClosed
                        }
                        other => other,
                    };
                    trace!(error = %error, "pipe: destination no longer writable");
                    if !prevent_cancel {
                        reader.cancel(Some(error.to_string())).await?;
                    }
                    return Err(error);
                }

                match reader.read().await {
                    Ok(Some(chunk)) => {
                        // Not awaited: failures surface through the next
                        // readiness check, in write order.
                        if let Err(error) = writer.enqueue(chunk) {
                            if !prevent_cancel {
                                reader.cancel(Some(error.to_string())).await?;
                            }
                            return Err(error);
                        }
                    }
                    Ok(None) => {
                        trace!("pipe: source completed");
                        if !prevent_close {
                            writer.close().await?;
                        }
                        return Ok(());
                    }
                    Err(read_err) => {
                        trace!(error = %read_err, "pipe: source errored");
                        if !prevent_abort {
                            writer.abort(Some(read_err.to_string())).await?;
                        }
                        return Err(read_err);
                    }
                }
            }
        };

        match signal {
            Some(registration) => match Abortable::new(pipe_loop, registration).await {
                Ok(result) => result,
                Err(Aborted) => {
                    trace!("pipe: canceled by signal");
                    let reason = "pipe was canceled".to_string();
                    if !prevent_cancel {
                        let _ = reader.cancel(Some(reason.clone())).await;
                    }
                    if !prevent_abort {
                        let _ = writer.abort(Some(reason.clone())).await;
                    }
                    Err(StreamError::Aborted(Some(reason)))
                }
            },
            None => pipe_loop.await,
        }
    }

    /// Pipe this stream into the writable side of a transform pair and hand
    /// back its readable side.
    pub fn pipe_through<O: Send + 'static>(
        self,
        pair: TransformPair<T, O>,
        options: Option<PipeOptions>,
    ) -> PipeBuilder<T, O> {
        PipeBuilder {
            source: self,
            pair,
            options,
        }
    }
}

/// A pre-built transform: anything exposing a writable entry and a readable
/// exit. The transform algorithm itself lives outside this crate.
pub struct TransformPair<I: Send + 'static, O: Send + 'static> {
    pub writable: WritableStream<I, Unlocked>,
    pub readable: ReadableStream<O, Unlocked>,
}

/// Deferred pipe into a transform pair; `prepare` or `spawn` starts it.
pub struct PipeBuilder<T: Send + 'static, O: Send + 'static> {
    source: ReadableStream<T, Unlocked>,
    pair: TransformPair<T, O>,
    options: Option<PipeOptions>,
}

impl<T, O> PipeBuilder<T, O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    /// The transform's readable side plus the unspawned pipe future.
    pub fn prepare(
        self,
    ) -> (
        ReadableStream<O, Unlocked>,
        impl Future<Output = StreamResult<()>> + Send,
    ) {
        let TransformPair { writable, readable } = self.pair;
        let source = self.source;
        let options = self.options;
        let pipe_future = async move { source.pipe_to(&writable, options).await };
        (readable, pipe_future)
    }

    /// Spawn the pipe and return the transform's readable side.
    pub fn spawn<F, R>(self, spawn_fn: F) -> ReadableStream<O, Unlocked>
    where
        F: FnOnce(BoxFuture<'static, ()>) -> R,
    {
        let (readable, pipe_future) = self.prepare();
        spawn_fn(Box::pin(async move {
            let _ = pipe_future.await;
        }));
        readable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{
        CountQueuingStrategy, ReadableSource, ReadableStreamDefaultController, WritableSink,
        WritableStreamDefaultController,
    };
    use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
    use futures::future::AbortHandle;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq)]
    enum SinkEvent {
        Write(i32),
        Close,
        Abort(Option<String>),
    }

    #[derive(Clone)]
    struct LogSink {
        events: Arc<Mutex<Vec<SinkEvent>>>,
        fail_on: Option<i32>,
    }

    impl LogSink {
        fn new() -> Self {
            Self {
                events: Arc::new(Mutex::new(Vec::new())),
                fail_on: None,
            }
        }

        fn failing_on(mut self, chunk: i32) -> Self {
            self.fail_on = Some(chunk);
            self
        }

        fn events(&self) -> Vec<SinkEvent> {
            self.events.lock().clone()
        }
    }

    impl WritableSink<i32> for LogSink {
        async fn write(
            &mut self,
            chunk: i32,
            _controller: &WritableStreamDefaultController,
        ) -> StreamResult<()> {
            if self.fail_on == Some(chunk) {
                return Err(format!("refusing chunk {chunk}").into());
            }
            self.events.lock().push(SinkEvent::Write(chunk));
            Ok(())
        }

        async fn close(self) -> StreamResult<()> {
            self.events.lock().push(SinkEvent::Close);
            Ok(())
        }

        async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.events.lock().push(SinkEvent::Abort(reason));
            Ok(())
        }
    }

    /// Source with an externally visible cancel log; pull drains a vec then
    /// either closes or errors.
    struct ScriptedSource {
        chunks: Vec<i32>,
        fail_at_end: bool,
        cancels: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl ReadableSource<i32> for ScriptedSource {
        async fn pull(
            &mut self,
            controller: &ReadableStreamDefaultController<i32>,
        ) -> StreamResult<()> {
            if self.chunks.is_empty() {
                if self.fail_at_end {
                    return Err("source blew up".into());
                }
                controller.close()?;
            } else {
                controller.enqueue(self.chunks.remove(0))?;
            }
            Ok(())
        }

        async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
            self.cancels.lock().push(reason);
            Ok(())
        }
    }

    fn scripted(
        chunks: Vec<i32>,
        fail_at_end: bool,
    ) -> (ReadableStream<i32>, Arc<Mutex<Vec<Option<String>>>>) {
        let cancels = Arc::new(Mutex::new(Vec::new()));
        let stream = ReadableStream::builder(ScriptedSource {
            chunks,
            fail_at_end,
            cancels: Arc::clone(&cancels),
        })
        .spawn(tokio::spawn)
        .unwrap();
        (stream, cancels)
    }

    fn log_dest(sink: LogSink, hwm: f64) -> WritableStream<i32> {
        WritableStream::builder(sink)
            .strategy(CountQueuingStrategy::new(hwm))
            .spawn(tokio::spawn)
            .unwrap()
    }

    #[tokio::test]
    async fn pipes_chunks_in_order_then_closes_destination() {
        let (source, cancels) = scripted(vec![1, 2], false);
        let sink = LogSink::new();
        let dest = log_dest(sink.clone(), 1.0);

        source.pipe_to(&dest, None).await.unwrap();

        assert_eq!(
            sink.events(),
            vec![SinkEvent::Write(1), SinkEvent::Write(2), SinkEvent::Close]
        );
        assert!(cancels.lock().is_empty());
    }

    #[tokio::test]
    async fn prevent_close_leaves_destination_open() {
        let (source, _) = scripted(vec![1], false);
        let sink = LogSink::new();
        let dest = log_dest(sink.clone(), 1.0);

        source
            .pipe_to(
                &dest,
                Some(PipeOptions {
                    prevent_close: true,
                    ..Default::default()
                }),
            )
            .await
            .unwrap();

        // The last write may still be in flight when the pipe resolves.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.events(), vec![SinkEvent::Write(1)]);
        assert!(!dest.is_closed());
    }

    #[tokio::test]
    async fn destination_write_failure_cancels_source_and_rejects() {
        let (source, cancels) = scripted(vec![1, 2, 3], false);
        let sink = LogSink::new().failing_on(2);
        let dest = log_dest(sink.clone(), 1.0);

        let err = source.pipe_to(&dest, None).await.unwrap_err();
        assert_eq!(err.to_string(), "refusing chunk 2");

        let cancels = cancels.lock().clone();
        assert_eq!(cancels.len(), 1);
        assert_eq!(cancels[0].as_deref(), Some("refusing chunk 2"));
        // Chunk 3 never reached the sink.
        assert_eq!(sink.events(), vec![SinkEvent::Write(1)]);
    }

    #[tokio::test]
    async fn prevent_cancel_leaves_source_alone_on_destination_error() {
        let (source, cancels) = scripted(vec![1, 2, 3], false);
        let sink = LogSink::new().failing_on(1);
        let dest = log_dest(sink, 1.0);

        let err = source
            .pipe_to(
                &dest,
                Some(PipeOptions {
                    prevent_cancel: true,
                    ..Default::default()
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "refusing chunk 1");
        assert!(cancels.lock().is_empty());
    }

    #[tokio::test]
    async fn source_error_aborts_destination_and_rejects() {
        let (source, _) = scripted(vec![1], true);
        let sink = LogSink::new();
        let dest = log_dest(sink.clone(), 1.0);

        let err = source.pipe_to(&dest, None).await.unwrap_err();
        assert_eq!(err.to_string(), "source blew up");

        let events = sink.events();
        assert!(matches!(
            events.last(),
            Some(SinkEvent::Abort(Some(reason))) if reason.contains("source blew up")
        ));
        assert!(!events.contains(&SinkEvent::Close));
    }

    #[tokio::test]
    async fn prevent_abort_leaves_destination_alone_on_source_error() {
        let (source, _) = scripted(vec![], true);
        let sink = LogSink::new();
        let dest = log_dest(sink.clone(), 1.0);

        let err = source
            .pipe_to(
                &dest,
                Some(PipeOptions {
                    prevent_abort: true,
                    ..Default::default()
                }),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "source blew up");
        assert!(sink.events().is_empty());
        assert!(!dest.is_errored());
    }

    #[tokio::test]
    async fn already_closed_destination_cancels_source() {
        let (source, cancels) = scripted(vec![1, 2], false);
        let sink = LogSink::new();
        let dest = log_dest(sink, 1.0);
        dest.close().await.unwrap();

        let err = source.pipe_to(&dest, None).await.unwrap_err();
        assert!(matches!(err, StreamError::DestinationClosed));
        assert_eq!(cancels.lock().len(), 1);
    }

    #[tokio::test]
    async fn cancel_signal_tears_down_both_ends() {
        struct StalledSource {
            cancels: Arc<Mutex<Vec<Option<String>>>>,
        }
        impl ReadableSource<i32> for StalledSource {
            async fn pull(
                &mut self,
                _controller: &ReadableStreamDefaultController<i32>,
            ) -> StreamResult<()> {
                futures::future::pending().await
            }
            async fn cancel(&mut self, reason: Option<String>) -> StreamResult<()> {
                self.cancels.lock().push(reason);
                Ok(())
            }
        }

        let cancels = Arc::new(Mutex::new(Vec::new()));
        let source = ReadableStream::builder(StalledSource {
            cancels: Arc::clone(&cancels),
        })
        .spawn(tokio::spawn)
        .unwrap();
        let sink = LogSink::new();
        let dest = log_dest(sink.clone(), 1.0);

        let (handle, registration) = AbortHandle::new_pair();
        let pipe = tokio::spawn(async move {
            source
                .pipe_to(
                    &dest,
                    Some(PipeOptions {
                        signal: Some(registration),
                        ..Default::default()
                    }),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.abort();

        let result = pipe.await.unwrap();
        assert!(matches!(result, Err(StreamError::Aborted(_))));
        assert_eq!(cancels.lock().len(), 1);
        assert!(matches!(sink.events()[..], [SinkEvent::Abort(_)]));
    }

    // Identity transform built from a channel: the writable side feeds the
    // readable side, closing it when the sink closes.
    struct ChannelSink<T: Send + 'static> {
        tx: UnboundedSender<T>,
    }

    impl<T: Send + 'static> WritableSink<T> for ChannelSink<T> {
        async fn write(
            &mut self,
            chunk: T,
            _controller: &WritableStreamDefaultController,
        ) -> StreamResult<()> {
            self.tx
                .unbounded_send(chunk)
                .map_err(|_| "transform readable side is gone".into())
        }
        // Dropping the sender on close ends the readable side.
    }

    fn identity_pair<T: Send + 'static>() -> TransformPair<T, T> {
        let (tx, rx): (UnboundedSender<T>, UnboundedReceiver<T>) = unbounded();
        let writable = WritableStream::builder(ChannelSink { tx })
            .spawn(tokio::spawn)
            .unwrap();
        let readable = ReadableStream::from_stream(rx).spawn(tokio::spawn).unwrap();
        TransformPair { writable, readable }
    }

    #[tokio::test]
    async fn pipe_through_exposes_the_transform_output() {
        let (source, _) = scripted(vec![7, 8, 9], false);
        let output = source
            .pipe_through(identity_pair(), None)
            .spawn(tokio::spawn);

        let (_locked, reader) = output.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), Some(7));
        assert_eq!(reader.read().await.unwrap(), Some(8));
        assert_eq!(reader.read().await.unwrap(), Some(9));
        assert_eq!(reader.read().await.unwrap(), None);
    }
}
