//! The carbonator metric buffer
//!
//! This library supplies [`Buffer`], the bounded queue that sits between the
//! collection cadence of the agent and the delivery cadence of each output.
//! Capacity is fixed at construction and is the only backpressure signal
//! there is: a producer that finds the buffer full waits for a bounded time
//! and then gets its item back in [`Error::Full`]. Nothing is ever dropped
//! without the caller knowing.
//!
//! Any number of producers and consumers may share one [`Buffer`]. Items from
//! a single producer are taken in the order that producer added them.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_comparisons)]
#![warn(unreachable_pub)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(clippy::multiple_crate_versions)]

use std::{fmt, num::NonZeroUsize};

use tokio::{
    sync::{
        Mutex,
        mpsc::{
            self,
            error::{SendTimeoutError, TrySendError},
        },
    },
    time::{self, Duration},
};

/// Errors produced by [`Buffer::try_add`] and [`Buffer::try_push`].
///
/// Both variants hand the rejected item back so the caller can decide
/// whether to retry, count it as lost or log it.
pub enum Error<T> {
    /// The buffer stayed full for the whole timeout window.
    Full(T),
    /// The buffer has been closed and accepts nothing further.
    Closed(T),
}

impl<T> Error<T> {
    /// Recover the item that could not be added.
    pub fn into_inner(self) -> T {
        match self {
            Error::Full(item) | Error::Closed(item) => item,
        }
    }

    /// Whether the failure was due to capacity rather than closure.
    pub fn is_full(&self) -> bool {
        matches!(self, Error::Full(_))
    }
}

impl<T> fmt::Debug for Error<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Full(_) => f.write_str("Full(..)"),
            Error::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

impl<T> fmt::Display for Error<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Full(_) => f.write_str("buffer remained full for the whole timeout"),
            Error::Closed(_) => f.write_str("buffer is closed"),
        }
    }
}

impl<T> std::error::Error for Error<T> {}

/// A bounded multi-producer, multi-consumer queue with timed insertion and
/// removal.
///
/// The producer side is a bounded [`tokio::sync::mpsc`] channel, which gives
/// per-producer FIFO for free. Consumers share the single receiver behind a
/// mutex; a consumer waiting on the lock counts against its own timeout.
pub struct Buffer<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
    capacity: NonZeroUsize,
}

impl<T> fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<T> Buffer<T> {
    /// Create a new [`Buffer`] holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: NonZeroUsize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.get());
        Self {
            sender,
            receiver: Mutex::new(receiver),
            capacity,
        }
    }

    /// Attempt to enqueue `item`, waiting up to `timeout` for space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Full`] if no slot opened up within `timeout` and
    /// [`Error::Closed`] if [`Buffer::close`] has been called. The item is
    /// returned in either case.
    pub async fn try_add(&self, item: T, timeout: Duration) -> Result<(), Error<T>> {
        match self.sender.send_timeout(item, timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(item)) => Err(Error::Full(item)),
            Err(SendTimeoutError::Closed(item)) => Err(Error::Closed(item)),
        }
    }

    /// Attempt to enqueue `item` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Full`] if no slot is free right now and
    /// [`Error::Closed`] if [`Buffer::close`] has been called. The item is
    /// returned in either case.
    pub fn try_push(&self, item: T) -> Result<(), Error<T>> {
        match self.sender.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(item)) => Err(Error::Full(item)),
            Err(TrySendError::Closed(item)) => Err(Error::Closed(item)),
        }
    }

    /// Attempt to dequeue one item, waiting up to `timeout` for one to
    /// arrive. Returns `None` on timeout or once the buffer is closed and
    /// drained.
    pub async fn try_take(&self, timeout: Duration) -> Option<T> {
        let take = async {
            let mut receiver = self.receiver.lock().await;
            receiver.recv().await
        };
        time::timeout(timeout, take).await.ok().flatten()
    }

    /// Close the buffer. Further [`Buffer::try_add`] calls fail with
    /// [`Error::Closed`]; items already buffered may still be taken.
    pub async fn close(&self) {
        self.receiver.lock().await.close();
    }

    /// Remove and drop everything currently buffered, returning how many
    /// items were discarded.
    pub async fn clear(&self) -> usize {
        let mut receiver = self.receiver.lock().await;
        let mut discarded = 0;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }

    /// The number of items currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.capacity.get() - self.sender.capacity()
    }

    /// Whether the buffer currently holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The fixed capacity given at construction.
    #[must_use]
    pub fn capacity(&self) -> NonZeroUsize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    fn buffer(capacity: usize) -> Buffer<u32> {
        Buffer::new(NonZeroUsize::new(capacity).expect("capacity must be non-zero"))
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("failed to build runtime")
    }

    #[tokio::test]
    async fn full_buffer_rejects_then_recovers_after_take() {
        let buf = buffer(3);
        for i in 0..3 {
            assert!(buf.try_add(i, SHORT).await.is_ok());
        }
        assert_eq!(buf.len(), 3);

        let rejected = buf.try_add(99, SHORT).await.expect_err("buffer should be full");
        assert!(rejected.is_full());
        assert_eq!(rejected.into_inner(), 99);

        assert_eq!(buf.try_take(SHORT).await, Some(0));
        assert!(buf.try_add(3, SHORT).await.is_ok());
        assert_eq!(buf.len(), 3);
    }

    #[tokio::test]
    async fn push_never_waits() {
        let buf = buffer(2);
        assert!(buf.try_push(1).is_ok());
        assert!(buf.try_push(2).is_ok());

        let started = tokio::time::Instant::now();
        let rejected = buf.try_push(3).expect_err("buffer should be full");
        assert!(started.elapsed() < SHORT);
        assert!(rejected.is_full());
        assert_eq!(rejected.into_inner(), 3);

        buf.close().await;
        let rejected = buf.try_push(4).expect_err("closed buffer accepted");
        assert!(!rejected.is_full());
        assert_eq!(buf.try_take(SHORT).await, Some(1));
    }

    #[tokio::test]
    async fn take_times_out_when_empty() {
        let buf = buffer(1);
        assert!(buf.is_empty());
        assert_eq!(buf.try_take(SHORT).await, None);
    }

    #[tokio::test]
    async fn blocked_producer_proceeds_when_consumer_takes() {
        let buf = Arc::new(buffer(1));
        buf.try_add(1, SHORT).await.expect("first add must succeed");

        let producer = {
            let buf = Arc::clone(&buf);
            tokio::spawn(async move { buf.try_add(2, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(SHORT).await;
        assert_eq!(buf.try_take(SHORT).await, Some(1));

        assert!(producer.await.expect("producer panicked").is_ok());
        assert_eq!(buf.try_take(SHORT).await, Some(2));
    }

    #[tokio::test]
    async fn closed_buffer_returns_items_and_drains() {
        let buf = buffer(4);
        buf.try_add(7, SHORT).await.expect("add before close");
        buf.close().await;

        let rejected = buf.try_add(8, SHORT).await.expect_err("closed buffer accepted");
        assert!(!rejected.is_full());
        assert_eq!(rejected.into_inner(), 8);

        assert_eq!(buf.try_take(SHORT).await, Some(7));
        assert_eq!(buf.try_take(SHORT).await, None);
    }

    #[tokio::test]
    async fn clear_discards_everything() {
        let buf = buffer(8);
        for i in 0..5 {
            buf.try_add(i, SHORT).await.expect("add");
        }
        assert_eq!(buf.clear().await, 5);
        assert!(buf.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn per_producer_order_survives_interleaving() {
        let buf = Arc::new(buffer(64));
        let mut producers = Vec::new();
        for producer in 0..4u32 {
            let buf = Arc::clone(&buf);
            producers.push(tokio::spawn(async move {
                for seq in 0..100u32 {
                    buf.try_add(producer * 1_000 + seq, Duration::from_secs(5))
                        .await
                        .expect("producer timed out");
                }
            }));
        }

        let mut last_seen = [None::<u32>; 4];
        let mut taken = 0;
        while taken < 400 {
            let item = buf
                .try_take(Duration::from_secs(5))
                .await
                .expect("consumer timed out");
            let producer = (item / 1_000) as usize;
            let seq = item % 1_000;
            if let Some(prev) = last_seen[producer] {
                assert!(seq > prev, "producer {producer} reordered: {prev} then {seq}");
            }
            last_seen[producer] = Some(seq);
            taken += 1;
        }

        for producer in producers {
            producer.await.expect("producer panicked");
        }
    }

    proptest! {
        #[test]
        fn capacity_is_exact(capacity in 1usize..64) {
            runtime().block_on(async {
                let buf = buffer(capacity);
                for i in 0..capacity {
                    prop_assert!(buf.try_add(i as u32, SHORT).await.is_ok());
                }
                prop_assert!(buf.try_add(0, Duration::from_millis(1)).await.is_err());
                prop_assert!(buf.try_take(SHORT).await.is_some());
                prop_assert!(buf.try_add(0, SHORT).await.is_ok());
                Ok(())
            })?;
        }

        #[test]
        fn single_producer_is_fifo(items in proptest::collection::vec(any::<u32>(), 1..128)) {
            runtime().block_on(async {
                let buf = buffer(items.len());
                for item in &items {
                    prop_assert!(buf.try_add(*item, SHORT).await.is_ok());
                }
                let mut drained = Vec::with_capacity(items.len());
                while let Some(item) = buf.try_take(Duration::from_millis(1)).await {
                    drained.push(item);
                }
                prop_assert_eq!(drained, items);
                Ok(())
            })?;
        }
    }
}
