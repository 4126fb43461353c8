//! Cancellable streaming primitive.
//!
//! A [`CancellableStream`] is a single-consumer, error-carrying asynchronous
//! sequence created as a connected producer/consumer pair. Exactly one
//! terminal event occurs per stream: the producer finishes (successfully or
//! with an error) or the consumer cancels. Termination hooks fire exactly
//! once per registration no matter which side terminated, which is what lets
//! the orchestrator release cancellation callbacks and close transport
//! resources without leaks or double-frees.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// A stream of response body chunks.
pub type BodyStream = CancellableStream<Bytes>;

/// A stream of cumulative byte counts reported while a payload uploads.
pub type ProgressStream = CancellableStream<u64>;

/// Why a stream reached its terminal state.
#[derive(Debug, Clone)]
pub enum Termination {
    /// The producer finished; carries its error if it finished unsuccessfully.
    Finished(Option<Error>),
    /// The consumer side cancelled; carries the error delivered to the consumer.
    Cancelled(Error),
}

/// Returned from [`StreamProducer::push`] once the stream has terminated.
/// Safe to ignore when the producer treats termination as a stop signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

type Hook = Box<dyn FnOnce(&Termination) + Send>;

/// Queue depth at which [`StreamProducer::send`] waits for the consumer.
const SEND_WINDOW: usize = 32;

struct State<T> {
    queue: VecDeque<T>,
    terminal: Option<Termination>,
    terminal_error_delivered: bool,
    hooks: Vec<Hook>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    room: Notify,
    error_on_cancel: Error,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record the terminal event if none has occurred yet, returning the hooks
    /// to run. Hooks are invoked outside the lock so they may touch the stream.
    fn terminate(&self, termination: Termination, discard_queue: bool) -> bool {
        let (hooks, termination) = {
            let mut state = self.lock();
            if state.terminal.is_some() {
                return false;
            }
            if discard_queue {
                state.queue.clear();
            }
            state.terminal = Some(termination.clone());
            (std::mem::take(&mut state.hooks), termination)
        };
        for hook in hooks {
            hook(&termination);
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
        // Senders blocked on a full queue must observe the terminal state.
        self.room.notify_waiters();
        self.room.notify_one();
        true
    }
}

/// The producer half of a stream pair.
///
/// Cloneable so a backend can feed one stream from several tasks; the first
/// terminal event wins and later pushes fail with [`StreamClosed`]. If every
/// producer handle drops without finishing, the stream finishes with an
/// [`Error::Unspecified`] so the consumer never hangs.
pub struct StreamProducer<T> {
    shared: Arc<Shared<T>>,
    _guard: Arc<ProducerGuard<T>>,
}

impl<T> Clone for StreamProducer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _guard: Arc::clone(&self._guard),
        }
    }
}

struct ProducerGuard<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Drop for ProducerGuard<T> {
    fn drop(&mut self) {
        self.shared.terminate(
            Termination::Finished(Some(Error::unspecified(
                "stream producer dropped without finishing",
            ))),
            false,
        );
    }
}

impl<T> StreamProducer<T> {
    /// Push the next item. Fails once any terminal event has occurred.
    pub fn push(&self, item: T) -> Result<(), StreamClosed> {
        let mut state = self.shared.lock();
        if state.terminal.is_some() {
            return Err(StreamClosed);
        }
        state.queue.push_back(item);
        drop(state);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Push the next item, waiting for queue room when the consumer lags.
    ///
    /// Body producers use this so an entire response never piles up in
    /// memory ahead of the consumer. Fails once any terminal event has
    /// occurred, including while waiting.
    pub async fn send(&self, item: T) -> Result<(), StreamClosed> {
        loop {
            let waiter = self.shared.room.notified();
            {
                let mut state = self.shared.lock();
                if state.terminal.is_some() {
                    return Err(StreamClosed);
                }
                if state.queue.len() < SEND_WINDOW {
                    state.queue.push_back(item);
                    drop(state);
                    self.shared.notify.notify_one();
                    return Ok(());
                }
            }
            waiter.await;
        }
    }

    /// Finish the stream successfully. No-op after any terminal event.
    pub fn finish(&self) -> Result<(), StreamClosed> {
        if self.shared.terminate(Termination::Finished(None), false) {
            Ok(())
        } else {
            Err(StreamClosed)
        }
    }

    /// Finish the stream with an error, delivered to the consumer after any
    /// queued items drain.
    pub fn finish_err(&self, error: Error) -> Result<(), StreamClosed> {
        if self
            .shared
            .terminate(Termination::Finished(Some(error)), false)
        {
            Ok(())
        } else {
            Err(StreamClosed)
        }
    }

    /// Whether a terminal event has occurred. Producers streaming large
    /// payloads should poll this to stop early on consumer cancellation.
    pub fn is_terminated(&self) -> bool {
        self.shared.lock().terminal.is_some()
    }
}

/// A handle that can cancel a stream or register termination hooks from
/// outside the consumer's call stack, e.g. from a cancellation token callback.
pub struct StreamCanceller<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for StreamCanceller<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> StreamCanceller<T> {
    pub fn cancel(&self) {
        let error = self.shared.error_on_cancel.clone();
        self.cancel_with(error);
    }

    pub fn cancel_with(&self, error: Error) {
        self.shared.terminate(Termination::Cancelled(error), true);
    }
}

/// The consumer half of a stream pair.
///
/// Dropping the consumer before termination cancels the stream, so an early
/// return upstream cannot leave a producer feeding an abandoned queue.
pub struct CancellableStream<T> {
    shared: Arc<Shared<T>>,
}

impl<T> CancellableStream<T> {
    /// Create a connected producer/consumer pair.
    ///
    /// `error_on_cancel` is the designated error delivered to the consumer
    /// and to termination hooks when [`cancel`](Self::cancel) is used.
    pub fn channel(error_on_cancel: Error) -> (StreamProducer<T>, Self) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                terminal: None,
                terminal_error_delivered: false,
                hooks: Vec::new(),
            }),
            notify: Notify::new(),
            room: Notify::new(),
            error_on_cancel,
        });
        let producer = StreamProducer {
            shared: Arc::clone(&shared),
            _guard: Arc::new(ProducerGuard {
                shared: Arc::clone(&shared),
            }),
        };
        (producer, Self { shared })
    }

    /// The next item, or the terminal error (delivered once), or `None` after
    /// the stream completed. This is the pipeline's only suspension point.
    pub async fn next(&mut self) -> Option<Result<T>> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.lock();
                match &state.terminal {
                    // Cancellation discards queued items; a producer finish
                    // lets them drain first.
                    Some(Termination::Cancelled(error)) => {
                        if state.terminal_error_delivered {
                            return None;
                        }
                        let error = error.clone();
                        state.terminal_error_delivered = true;
                        return Some(Err(error));
                    }
                    _ => {}
                }
                if let Some(item) = state.queue.pop_front() {
                    drop(state);
                    self.shared.room.notify_one();
                    return Some(Ok(item));
                }
                match &state.terminal {
                    Some(Termination::Finished(None)) => return None,
                    Some(Termination::Finished(Some(error))) => {
                        if state.terminal_error_delivered {
                            return None;
                        }
                        let error = error.clone();
                        state.terminal_error_delivered = true;
                        return Some(Err(error));
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Cancel with the designated cancellation error. Idempotent; a stream
    /// that already terminated is unaffected.
    pub fn cancel(&self) {
        self.canceller().cancel();
    }

    /// Cancel with a specific error, e.g. [`Error::RequestTimedOut`] from an
    /// externally injected timeout.
    pub fn cancel_with(&self, error: Error) {
        self.canceller().cancel_with(error);
    }

    pub fn canceller(&self) -> StreamCanceller<T> {
        StreamCanceller {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register a termination hook.
    ///
    /// Every hook is invoked exactly once, whichever side terminates the
    /// stream. Registering after termination invokes the hook immediately.
    pub fn on_finish(&self, hook: impl FnOnce(&Termination) + Send + 'static) {
        let termination = {
            let mut state = self.shared.lock();
            match &state.terminal {
                Some(termination) => termination.clone(),
                None => {
                    state.hooks.push(Box::new(hook));
                    return;
                }
            }
        };
        hook(&termination);
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lock().terminal.is_some()
    }

    /// Adapt to a [`futures_util::Stream`] of results.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send
    where
        T: Send + 'static,
    {
        futures_util::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|item| (item, stream))
        })
    }
}

impl<T> Drop for CancellableStream<T> {
    fn drop(&mut self) {
        let error = self.shared.error_on_cancel.clone();
        self.shared.terminate(Termination::Cancelled(error), true);
    }
}

/// Play an ordered list of body streams as one, advancing a cursor forward
/// past each exhausted child. A child error or a cancellation of the combined
/// stream stops playback and closes the remaining children.
pub fn concat(children: Vec<BodyStream>, error_on_cancel: Error) -> BodyStream {
    let (producer, combined) = CancellableStream::channel(error_on_cancel);
    tokio::spawn(async move {
        let mut children = children.into_iter();
        while let Some(mut child) = children.next() {
            while let Some(item) = child.next().await {
                match item {
                    Ok(chunk) => {
                        if producer.send(chunk).await.is_err() {
                            child.cancel();
                            return;
                        }
                    }
                    Err(error) => {
                        let _ = producer.finish_err(error);
                        return;
                    }
                }
            }
            // Remaining children are cancelled by drop if the loop exits early.
        }
        let _ = producer.finish();
    });
    combined
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn items_arrive_in_order_then_none() {
        let (producer, mut stream) = BodyStream::channel(Error::RequestCancelled);
        producer.push(Bytes::from_static(b"one")).unwrap();
        producer.push(Bytes::from_static(b"two")).unwrap();
        producer.finish().unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "one");
        assert_eq!(stream.next().await.unwrap().unwrap(), "two");
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn queued_items_drain_before_finish_error() {
        let (producer, mut stream) = BodyStream::channel(Error::RequestCancelled);
        producer.push(Bytes::from_static(b"data")).unwrap();
        producer.finish_err(Error::NoData).unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), "data");
        assert_eq!(stream.next().await.unwrap().unwrap_err(), Error::NoData);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_discards_queue_and_delivers_designated_error() {
        let (producer, mut stream) = BodyStream::channel(Error::RequestCancelled);
        producer.push(Bytes::from_static(b"ignored")).unwrap();
        stream.cancel();

        assert_eq!(
            stream.next().await.unwrap().unwrap_err(),
            Error::RequestCancelled,
        );
        assert!(stream.next().await.is_none());
        assert_eq!(producer.push(Bytes::new()), Err(StreamClosed));
    }

    #[tokio::test]
    async fn push_after_finish_fails_silently() {
        let (producer, _stream) = BodyStream::channel(Error::RequestCancelled);
        producer.finish().unwrap();

        assert_eq!(producer.push(Bytes::new()), Err(StreamClosed));
        assert_eq!(producer.finish(), Err(StreamClosed));
    }

    #[tokio::test]
    async fn hooks_fire_exactly_once_each() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (_producer, stream) = BodyStream::channel(Error::RequestCancelled);
        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            stream.on_finish(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        stream.cancel();
        stream.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        // Registration after termination still fires, immediately and once.
        let fired_late = Arc::clone(&fired);
        stream.on_finish(move |termination| {
            assert!(matches!(termination, Termination::Cancelled(_)));
            fired_late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn timeout_injection_uses_supplied_error() {
        let (_producer, mut stream) = BodyStream::channel(Error::RequestCancelled);
        stream.cancel_with(Error::RequestTimedOut);

        assert_eq!(
            stream.next().await.unwrap().unwrap_err(),
            Error::RequestTimedOut,
        );
    }

    #[tokio::test]
    async fn dropping_all_producers_without_finishing_errors_the_stream() {
        let (producer, mut stream) = BodyStream::channel(Error::RequestCancelled);
        drop(producer);

        assert!(matches!(
            stream.next().await.unwrap().unwrap_err(),
            Error::Unspecified { .. },
        ));
    }

    #[tokio::test]
    async fn send_waits_for_queue_room() {
        let (producer, mut stream) = BodyStream::channel(Error::RequestCancelled);
        for _ in 0..SEND_WINDOW {
            producer.send(Bytes::from_static(b"x")).await.unwrap();
        }

        // The window is full, so another send parks until the consumer reads.
        let blocked = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            producer.send(Bytes::from_static(b"y")),
        );
        assert!(blocked.await.is_err());

        stream.next().await.unwrap().unwrap();
        tokio::time::timeout(
            std::time::Duration::from_millis(200),
            producer.send(Bytes::from_static(b"y")),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn send_fails_after_cancellation() {
        let (producer, stream) = BodyStream::channel(Error::RequestCancelled);
        stream.cancel();
        assert_eq!(
            producer.send(Bytes::from_static(b"late")).await,
            Err(StreamClosed),
        );
    }

    #[tokio::test]
    async fn concat_plays_children_in_order() {
        let (first_tx, first) = BodyStream::channel(Error::RequestCancelled);
        let (second_tx, second) = BodyStream::channel(Error::RequestCancelled);
        first_tx.push(Bytes::from_static(b"a")).unwrap();
        first_tx.finish().unwrap();
        second_tx.push(Bytes::from_static(b"b")).unwrap();
        second_tx.finish().unwrap();

        let mut combined = concat(vec![first, second], Error::RequestCancelled);
        assert_eq!(combined.next().await.unwrap().unwrap(), "a");
        assert_eq!(combined.next().await.unwrap().unwrap(), "b");
        assert!(combined.next().await.is_none());
    }

    #[tokio::test]
    async fn concat_propagates_child_errors() {
        let (first_tx, first) = BodyStream::channel(Error::RequestCancelled);
        first_tx.finish_err(Error::NoData).unwrap();
        let (_second_tx, second) = BodyStream::channel(Error::RequestCancelled);

        let mut combined = concat(vec![first, second], Error::RequestCancelled);
        assert_eq!(combined.next().await.unwrap().unwrap_err(), Error::NoData);
    }
}
