//! Flow-controlled streaming primitives: a readable source and a writable
//! sink, each backed by a size-tracked queue, connected by pipe and tee
//! algorithms that propagate completion, errors and cancellation in both
//! directions without unbounded buffering.
//!
//! Streams are runtime-agnostic: construction hands back the stream handle
//! plus a driver future, and the caller decides how to spawn it.
//!
//! ```no_run
//! use flowstream::ReadableStream;
//!
//! # async fn demo() -> Result<(), flowstream::StreamError> {
//! let stream = ReadableStream::from_vec(vec![1, 2, 3]).spawn(tokio::spawn)?;
//! let (_locked, reader) = stream.get_reader()?;
//! while let Some(chunk) = reader.read().await? {
//!     println!("{chunk}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod streams;

pub use streams::{
    error::{StreamError, StreamResult},
    pipe::{PipeBuilder, PipeOptions, TransformPair},
    queue::{QueueElement, SizedQueue},
    readable::{
        AsyncStreamSource, EnqueueController, IteratorSource, ReadableSource, ReadableState,
        ReadableStream, ReadableStreamBuilder, ReadableStreamDefaultController,
        ReadableStreamDefaultReader,
    },
    tee::TeeBuilder,
    writable::{
        WritableSink, WritableState, WritableStream, WritableStreamBuilder,
        WritableStreamDefaultController, WritableStreamDefaultWriter,
    },
    ByteLengthQueuingStrategy, CountQueuingStrategy, Locked, QueuingStrategy, Unlocked,
};
