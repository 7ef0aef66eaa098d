//! End-to-end composition: sources piped through transforms, teed, and
//! drained under backpressure.

use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedSender};
use parking_lot::Mutex;

use flowstream::{
    ByteLengthQueuingStrategy, CountQueuingStrategy, PipeOptions, ReadableStream, StreamError,
    StreamResult, TransformPair, WritableSink, WritableStream, WritableStreamDefaultController,
};

#[derive(Clone, Debug, PartialEq)]
enum Event {
    Write(String),
    Close,
    Abort(Option<String>),
}

#[derive(Clone)]
struct LogSink {
    events: Arc<Mutex<Vec<Event>>>,
    write_delay: Duration,
}

impl LogSink {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            write_delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl WritableSink<String> for LogSink {
    async fn write(
        &mut self,
        chunk: String,
        _controller: &WritableStreamDefaultController,
    ) -> StreamResult<()> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        self.events.lock().push(Event::Write(chunk));
        Ok(())
    }

    async fn close(self) -> StreamResult<()> {
        self.events.lock().push(Event::Close);
        Ok(())
    }

    async fn abort(&mut self, reason: Option<String>) -> StreamResult<()> {
        self.events.lock().push(Event::Abort(reason));
        Ok(())
    }
}

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
            .map_err(|_| StreamError::from("transform readable side is gone"))
    }
}

fn uppercase_pair() -> TransformPair<String, String> {
    let (tx, rx) = unbounded::<String>();
    let writable = WritableStream::builder(ChannelSink { tx })
        .spawn(tokio::spawn)
        .unwrap();
    let readable = ReadableStream::from_stream(futures::StreamExt::map(rx, |s: String| {
        s.to_uppercase()
    }))
    .spawn(tokio::spawn)
    .unwrap();
    TransformPair { writable, readable }
}

#[tokio::test]
async fn source_through_transform_into_sink_preserves_order_and_closes() {
    let words: Vec<String> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let source = ReadableStream::from_vec(words).spawn(tokio::spawn).unwrap();

    let sink = LogSink::new().with_delay(Duration::from_millis(2));
    let dest = WritableStream::builder(sink.clone())
        .strategy(CountQueuingStrategy::new(1.0))
        .spawn(tokio::spawn)
        .unwrap();

    let transformed = source.pipe_through(uppercase_pair(), None).spawn(tokio::spawn);
    transformed.pipe_to(&dest, None).await.unwrap();

    assert_eq!(
        sink.events(),
        vec![
            Event::Write("ALPHA".into()),
            Event::Write("BETA".into()),
            Event::Write("GAMMA".into()),
            Event::Close,
        ]
    );
}

#[tokio::test]
async fn teed_source_feeds_two_destinations() {
    let words: Vec<String> = ["one", "two"].iter().map(|s| s.to_string()).collect();
    let source = ReadableStream::from_vec(words).spawn(tokio::spawn).unwrap();
    let (first, second) = source.tee().spawn(tokio::spawn).unwrap();

    let sink1 = LogSink::new();
    let sink2 = LogSink::new();
    let dest1 = WritableStream::builder(sink1.clone())
        .spawn(tokio::spawn)
        .unwrap();
    let dest2 = WritableStream::builder(sink2.clone())
        .spawn(tokio::spawn)
        .unwrap();

    let (r1, r2) = futures::join!(first.pipe_to(&dest1, None), second.pipe_to(&dest2, None));
    r1.unwrap();
    r2.unwrap();

    let expected = vec![
        Event::Write("one".into()),
        Event::Write("two".into()),
        Event::Close,
    ];
    assert_eq!(sink1.events(), expected);
    assert_eq!(sink2.events(), expected);
}

#[tokio::test]
async fn byte_length_strategy_throttles_by_chunk_size() {
    let chunks: Vec<String> = vec!["aaaa".into(), "bb".into(), "c".into()];
    let source = ReadableStream::from_vec(chunks).spawn(tokio::spawn).unwrap();

    let sink = LogSink::new().with_delay(Duration::from_millis(2));
    let dest = WritableStream::builder(sink.clone())
        .strategy(ByteLengthQueuingStrategy::new(4.0))
        .spawn(tokio::spawn)
        .unwrap();

    source.pipe_to(&dest, None).await.unwrap();

    assert_eq!(
        sink.events(),
        vec![
            Event::Write("aaaa".into()),
            Event::Write("bb".into()),
            Event::Write("c".into()),
            Event::Close,
        ]
    );
}

#[tokio::test]
async fn prevent_close_allows_writing_a_trailer() {
    let words: Vec<String> = vec!["body".into()];
    let source = ReadableStream::from_vec(words).spawn(tokio::spawn).unwrap();

    let sink = LogSink::new();
    let dest = WritableStream::builder(sink.clone())
        .spawn(tokio::spawn)
        .unwrap();

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

    // The destination is still writable: append a trailer and close it
    // ourselves.
    let (_locked, writer) = dest.get_writer().unwrap();
    writer.write("trailer".to_string()).await.unwrap();
    writer.close().await.unwrap();

    assert_eq!(
        sink.events(),
        vec![
            Event::Write("body".into()),
            Event::Write("trailer".into()),
            Event::Close,
        ]
    );
}
