pub mod error;
pub mod pipe;
pub mod queue;
pub mod readable;
pub mod tee;
pub mod writable;

// Re-export main types
pub use error::*;
pub use pipe::*;
pub use queue::*;
pub use readable::*;
pub use tee::*;
pub use writable::*;

use std::{sync::Arc, task::Waker};

use parking_lot::Mutex;

/// Type-level marker for unlocked streams
pub struct Unlocked;
/// Type-level marker for locked streams
pub struct Locked;

/// Generic queuing strategy trait
pub trait QueuingStrategy<T>: Send {
    /// Size of the chunk. Must be finite and non-negative; anything else is
    /// treated as a failing size algorithm and errors the stream.
    fn size(&self, chunk: &T) -> f64;
    /// Queue total size above which backpressure applies.
    fn high_water_mark(&self) -> f64;
}

/// Count-based strategy: every chunk counts as 1.
#[derive(Clone)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl<T: Send> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> f64 {
        1.0
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Byte length strategy for chunk types with a known byte size.
#[derive(Clone)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<&'static [u8]> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &&'static [u8]) -> f64 {
        chunk.len() as f64
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// High water marks must be finite and non-negative.
pub(crate) fn validate_high_water_mark(hwm: f64) -> error::StreamResult<f64> {
    if hwm.is_finite() && hwm >= 0.0 {
        Ok(hwm)
    } else {
        Err(error::StreamError::Configuration(format!(
            "high water mark must be a finite, non-negative number (got {hwm})"
        )))
    }
}

/// Set of wakers registered by `ready()`/`closed()` notification futures.
#[derive(Clone, Default)]
pub(crate) struct WakerSet(Arc<Mutex<Vec<Waker>>>);

impl WakerSet {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    pub(crate) fn wake_all(&self) {
        for waker in self.0.lock().drain(..) {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_strategy_sizes_every_chunk_as_one() {
        let strategy = CountQueuingStrategy::new(4.0);
        assert_eq!(
            QueuingStrategy::<String>::size(&strategy, &"x".to_string()),
            1.0
        );
        assert_eq!(QueuingStrategy::<String>::high_water_mark(&strategy), 4.0);
    }

    #[test]
    fn byte_length_strategy_uses_chunk_length() {
        let strategy = ByteLengthQueuingStrategy::new(16.0);
        assert_eq!(strategy.size(&vec![0u8; 5]), 5.0);
        assert_eq!(strategy.size(&"hello!".to_string()), 6.0);
    }

    #[test]
    fn high_water_mark_validation_rejects_non_finite_values() {
        assert!(validate_high_water_mark(0.0).is_ok());
        assert!(validate_high_water_mark(1.5).is_ok());
        for bad in [f64::NAN, f64::INFINITY, -1.0] {
            assert!(matches!(
                validate_high_water_mark(bad),
                Err(error::StreamError::Configuration(_))
            ));
        }
    }
}
