//! Asynchronous replay buffer and cursors.
//!
//! Each upstream pull is a [`Shared`] future stored in the buffer. Whoever
//! needs an unbuffered index either starts the pull or joins the one already
//! running, so the producer is never polled on behalf of two pulls at once.
//! The pull only holds a [`Weak`] handle to its buffer.

use crate::buffer::Terminal;
use crate::error::{ensure_positive, ForkError, ForkResult};
use futures_util::future::{poll_fn, BoxFuture, FutureExt, Shared};
use futures_util::stream::{BoxStream, FusedStream, Stream, StreamExt};
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

type PullFuture = Shared<BoxFuture<'static, PullOutcome>>;

/// How an in-flight pull ended. The pulled value itself goes straight into
/// the buffer, so waiters re-read the state afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PullOutcome {
    Recorded,
    Cancelled,
}

struct InFlight {
    id: u64,
    future: PullFuture,
    // Token of the task that started the pull.
    token: CancellationToken,
}

struct State<T, E> {
    items: Vec<T>,
    terminal: Terminal<E>,
    in_flight: Option<InFlight>,
    next_pull_id: u64,
}

/// Async counterpart of [`ReplayBuffer`](crate::ReplayBuffer).
///
/// Any number of tasks may await any index concurrently. Cancellation is
/// cooperative through [`CancellationToken`]:
///
/// - A task that cancels while waiting on a pull someone else started only
///   abandons its own wait.
/// - A task that cancels while waiting on the pull it started cancels that
///   pull, and every task waiting on it observes [`ForkError::Cancelled`].
///
/// A cancelled pull leaves no trace in the buffer; the next request for the
/// same index starts a fresh one.
pub struct AsyncReplayBuffer<T, E = Infallible> {
    state: Mutex<State<T, E>>,
    // Only polled from inside the current in-flight pull.
    producer: Mutex<Option<BoxStream<'static, ForkResult<T, E>>>>,
    #[cfg(feature = "stats")]
    stats: crate::stats::Stats,
}

impl<T, E> AsyncReplayBuffer<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a buffer over a fallible producer stream.
    pub fn new<S>(producer: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        Self::from_boxed(
            producer
                .map(|item| item.map_err(ForkError::Upstream))
                .boxed(),
        )
    }

    pub(crate) fn from_boxed(producer: BoxStream<'static, ForkResult<T, E>>) -> Self {
        Self {
            state: Mutex::new(State {
                items: Vec::new(),
                terminal: Terminal::Open,
                in_flight: None,
                next_pull_id: 0,
            }),
            producer: Mutex::new(Some(producer)),
            #[cfg(feature = "stats")]
            stats: crate::stats::Stats::new(),
        }
    }

    /// Returns the item at `index`, pulling from the producer if needed.
    ///
    /// Suspends while another task's pull is in flight instead of pulling a
    /// second time. Returns [`ForkError::Cancelled`] if `token` fires first,
    /// or if the pull being awaited was cancelled by the task that started it.
    pub async fn get_or_fetch(
        self: &Arc<Self>,
        index: usize,
        token: &CancellationToken,
    ) -> ForkResult<Option<T>, E> {
        if token.is_cancelled() {
            return Err(ForkError::Cancelled);
        }
        loop {
            let (pull, joined_abandoned) = {
                let mut state = self.lock_state();
                if let Some(item) = state.items.get(index) {
                    return Ok(Some(item.clone()));
                }
                match &state.terminal {
                    Terminal::Exhausted => return Ok(None),
                    Terminal::Failed(err) => return Err(err.clone()),
                    Terminal::Open => {}
                }
                self.join_or_start_pull(&mut state, token)
            };

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ForkError::Cancelled),
                outcome = pull => outcome,
            };
            // Waiters that joined a pull whose initiator had already given up
            // retry with a pull of their own.
            if outcome == PullOutcome::Cancelled && !joined_abandoned {
                return Err(ForkError::Cancelled);
            }
        }
    }

    /// Returns the pull to await, and whether its initiator had already
    /// cancelled it when it was joined.
    ///
    /// An abandoned pull may still be inside the producer, so it is joined
    /// rather than replaced; it settles as soon as it is polled again.
    fn join_or_start_pull(
        self: &Arc<Self>,
        state: &mut State<T, E>,
        token: &CancellationToken,
    ) -> (PullFuture, bool) {
        if let Some(in_flight) = &state.in_flight {
            return (in_flight.future.clone(), in_flight.token.is_cancelled());
        }

        let id = state.next_pull_id;
        state.next_pull_id += 1;
        let index = state.items.len();
        let future = self.start_pull(id, index, token.clone());
        state.in_flight = Some(InFlight {
            id,
            future: future.clone(),
            token: token.clone(),
        });
        (future, false)
    }

    fn start_pull(self: &Arc<Self>, id: u64, index: usize, token: CancellationToken) -> PullFuture {
        // The pull lives inside the buffer's own state, so it must not keep
        // the buffer alive. Whoever polls it holds a strong handle.
        let buffer = Arc::downgrade(self);
        async move {
            trace!(index, "pulling from upstream stream");
            let polled = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = poll_fn(|cx| poll_upgraded(&buffer, cx)) => next,
            };
            match buffer.upgrade() {
                Some(buffer) => buffer.finish_pull(id, index, polled),
                None => PullOutcome::Cancelled,
            }
        }
        .boxed()
        .shared()
    }

    fn poll_producer(&self, cx: &mut Context<'_>) -> Poll<Option<ForkResult<T, E>>> {
        let mut producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
        match producer.as_mut() {
            Some(stream) => stream.poll_next_unpin(cx),
            None => Poll::Ready(None),
        }
    }

    fn finish_pull(
        &self,
        id: u64,
        index: usize,
        polled: Option<Option<ForkResult<T, E>>>,
    ) -> PullOutcome {
        let mut state = self.lock_state();
        if state.in_flight.as_ref().is_some_and(|pull| pull.id == id) {
            state.in_flight = None;
        }

        let Some(pulled) = polled else {
            debug!(index, "upstream pull cancelled by its initiator");
            #[cfg(feature = "stats")]
            self.stats.record_cancelled_pull();
            return PullOutcome::Cancelled;
        };

        debug_assert_eq!(index, state.items.len(), "pull recorded out of order");
        #[cfg(feature = "stats")]
        self.stats.record_pull();
        match pulled {
            Some(Ok(item)) => state.items.push(item),
            Some(Err(err)) => {
                debug!(index, "upstream failed, caching failure");
                state.terminal = Terminal::Failed(err);
                self.release_producer();
            }
            None => {
                debug!(len = index, "upstream exhausted");
                state.terminal = Terminal::Exhausted;
                self.release_producer();
            }
        }
        PullOutcome::Recorded
    }

    fn release_producer(&self) {
        self.producer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

fn poll_upgraded<T, E>(
    buffer: &Weak<AsyncReplayBuffer<T, E>>,
    cx: &mut Context<'_>,
) -> Poll<Option<Option<ForkResult<T, E>>>>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    match buffer.upgrade() {
        Some(buffer) => buffer.poll_producer(cx).map(Some),
        None => Poll::Ready(None),
    }
}

impl<T, E> AsyncReplayBuffer<T, E> {
    fn lock_state(&self) -> MutexGuard<'_, State<T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of items materialized so far.
    pub fn buffered_len(&self) -> usize {
        self.lock_state().items.len()
    }

    /// Returns `true` once the end of the sequence or a failure is recorded.
    pub fn is_complete(&self) -> bool {
        !matches!(self.lock_state().terminal, Terminal::Open)
    }

    /// Returns the runtime counters of this buffer.
    #[cfg(feature = "stats")]
    #[cfg_attr(docsrs, doc(cfg(feature = "stats")))]
    pub fn stats(&self) -> crate::stats::Stats {
        self.stats.clone()
    }
}

impl<T> AsyncReplayBuffer<T, Infallible>
where
    T: Clone + Send + 'static,
{
    /// Creates a buffer over an infallible producer stream.
    pub fn from_stream<S>(producer: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::from_boxed(producer.map(Ok).boxed())
    }
}

impl<T, E> fmt::Debug for AsyncReplayBuffer<T, E>
where
    T: fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("AsyncReplayBuffer")
            .field("items", &state.items)
            .field("terminal", &state.terminal)
            .field("pull_in_flight", &state.in_flight.is_some())
            .finish_non_exhaustive()
    }
}

/// Async counterpart of [`Cursor`](crate::Cursor).
///
/// Every read takes the caller's [`CancellationToken`].
///
/// ```
/// use stream_fork::AsyncCursor;
/// use futures_util::stream;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let token = CancellationToken::new();
/// let cursor = AsyncCursor::from_stream(stream::iter(vec![1, 2, 3]));
///
/// let (first, next) = cursor.try_next(&token).await.unwrap();
/// assert_eq!(first, Some(1));
/// assert_eq!(next.lookahead(1, &token).await.unwrap(), Some(3));
/// assert_eq!(cursor.position(), 0);
/// # });
/// ```
pub struct AsyncCursor<T, E = Infallible> {
    buffer: Arc<AsyncReplayBuffer<T, E>>,
    position: usize,
}

impl<T, E> Clone for AsyncCursor<T, E> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            position: self.position,
        }
    }
}

impl<T, E> fmt::Debug for AsyncCursor<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCursor")
            .field("position", &self.position)
            .field("buffered", &self.buffer.buffered_len())
            .finish()
    }
}

impl<T, E> AsyncCursor<T, E> {
    /// Creates a cursor at position 0 of `buffer`.
    pub fn new(buffer: Arc<AsyncReplayBuffer<T, E>>) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Index of the next unread item.
    pub fn position(&self) -> usize {
        self.position
    }

    /// The shared buffer behind this cursor.
    pub fn buffer(&self) -> &Arc<AsyncReplayBuffer<T, E>> {
        &self.buffer
    }

    /// Number of items the shared buffer has materialized so far.
    pub fn buffered_len(&self) -> usize {
        self.buffer.buffered_len()
    }

    /// Returns an independent copy at the same position.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Returns a cursor `n` positions further along without reading anything.
    pub fn skip(&self, n: usize) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            position: self.position.saturating_add(n),
        }
    }
}

impl<T, E> AsyncCursor<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a cursor over a fresh buffer wrapping a fallible stream.
    pub fn from_results<S>(producer: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        Self::new(Arc::new(AsyncReplayBuffer::new(producer)))
    }

    /// Returns the item at the current position without advancing.
    pub async fn peek(&self, token: &CancellationToken) -> ForkResult<Option<T>, E> {
        self.buffer.get_or_fetch(self.position, token).await
    }

    /// Returns the item `offset` positions ahead without advancing.
    pub async fn lookahead(
        &self,
        offset: usize,
        token: &CancellationToken,
    ) -> ForkResult<Option<T>, E> {
        let index = self
            .position
            .checked_add(offset)
            .ok_or(ForkError::InvalidArgument("lookahead offset overflows position"))?;
        self.buffer.get_or_fetch(index, token).await
    }

    /// Reads the current item and returns it with a cursor advanced by one.
    pub async fn try_next(&self, token: &CancellationToken) -> ForkResult<(Option<T>, Self), E> {
        match self.peek(token).await? {
            Some(item) => Ok((Some(item), self.skip(1))),
            None => Ok((None, self.clone())),
        }
    }

    /// Returns `true` if no item is left at the current position.
    pub async fn is_exhausted(&self, token: &CancellationToken) -> ForkResult<bool, E> {
        Ok(self.peek(token).await?.is_none())
    }

    /// Splits the remainder into consecutive groups of `size` items.
    ///
    /// Items read before a failure are yielded as a short group first; the
    /// failure follows as the next element.
    pub fn batch(
        &self,
        size: usize,
        token: &CancellationToken,
    ) -> ForkResult<BoxStream<'static, ForkResult<Vec<T>, E>>, E> {
        let size = ensure_positive(size, "batch size must be greater than zero")?;
        let cursor = self.clone();
        let token = token.clone();
        let batches = futures_util::stream::unfold(Some(cursor), move |cursor| {
            let token = token.clone();
            async move {
                let mut cursor = cursor?;
                let mut group = Vec::with_capacity(size);
                while group.len() < size {
                    match cursor.peek(&token).await {
                        Ok(Some(item)) => {
                            group.push(item);
                            cursor.position += 1;
                        }
                        Ok(None) if group.is_empty() => return None,
                        Ok(None) => return Some((Ok(group), None)),
                        Err(err) if group.is_empty() => return Some((Err(err), None)),
                        Err(_) => return Some((Ok(group), Some(cursor))),
                    }
                }
                Some((Ok(group), Some(cursor)))
            }
        });
        Ok(batches.boxed())
    }

    /// Turns the cursor into a [`Stream`] that reads from its position on.
    pub fn into_stream(self, token: CancellationToken) -> ForkStream<T, E> {
        ForkStream {
            cursor: self,
            token,
            pending: None,
            done: false,
        }
    }
}

impl<T> AsyncCursor<T, Infallible>
where
    T: Clone + Send + 'static,
{
    /// Creates a cursor over a fresh buffer wrapping an infallible stream.
    pub fn from_stream<S>(producer: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::new(Arc::new(AsyncReplayBuffer::from_stream(producer)))
    }
}

/// A [`Stream`] over an [`AsyncCursor`], created by [`AsyncCursor::into_stream`].
///
/// Yields `Ok` items until the end. A failure or a cancellation is yielded
/// once as `Err`, after which the stream is terminated.
pub struct ForkStream<T, E = Infallible> {
    cursor: AsyncCursor<T, E>,
    token: CancellationToken,
    pending: Option<BoxFuture<'static, ForkResult<Option<T>, E>>>,
    done: bool,
}

impl<T, E> ForkStream<T, E> {
    /// Position of the next item this stream would yield.
    pub fn position(&self) -> usize {
        self.cursor.position
    }
}

impl<T, E> fmt::Debug for ForkStream<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForkStream")
            .field("cursor", &self.cursor)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<T, E> Stream for ForkStream<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    type Item = ForkResult<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }

        let this = &mut *self;
        let pending = this.pending.get_or_insert_with(|| {
            let buffer = Arc::clone(&this.cursor.buffer);
            let index = this.cursor.position;
            let token = this.token.clone();
            async move { buffer.get_or_fetch(index, &token).await }.boxed()
        });

        let fetched = match pending.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(fetched) => fetched,
        };
        this.pending = None;

        match fetched {
            Ok(Some(item)) => {
                this.cursor.position += 1;
                Poll::Ready(Some(Ok(item)))
            }
            Ok(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Err(err) => {
                this.done = true;
                Poll::Ready(Some(Err(err)))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            return (0, Some(0));
        }
        let buffered = self.cursor.buffer.buffered_len();
        (buffered.saturating_sub(self.cursor.position), None)
    }
}

impl<T, E> FusedStream for ForkStream<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn is_terminated(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// A stream that counts how often it was polled to completion.
    fn counted_stream(n: usize) -> (impl Stream<Item = usize> + Send, Arc<AtomicUsize>) {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulls);
        let stream = stream::unfold(0, move |next| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::task::yield_now().await;
                (next < n).then(|| (next + 1, next + 1))
            }
        });
        (stream, pulls)
    }

    /// A stream that never yields until its gate is opened.
    fn gated(items: Vec<i32>, gate: Arc<tokio::sync::Notify>) -> impl Stream<Item = i32> + Send {
        stream::unfold((items.into_iter(), gate), |(mut items, gate)| async move {
            gate.notified().await;
            items.next().map(|item| (item, (items, gate)))
        })
    }

    #[tokio::test]
    async fn test_buffer_is_lazy_and_memoized() {
        let token = CancellationToken::new();
        let (stream, pulls) = counted_stream(5);
        let buffer = Arc::new(AsyncReplayBuffer::from_stream(stream));
        assert_eq!(pulls.load(Ordering::SeqCst), 0);

        assert_eq!(buffer.get_or_fetch(2, &token).await, Ok(Some(3)));
        assert_eq!(pulls.load(Ordering::SeqCst), 3);

        assert_eq!(buffer.get_or_fetch(0, &token).await, Ok(Some(1)));
        assert_eq!(buffer.get_or_fetch(2, &token).await, Ok(Some(3)));
        assert_eq!(pulls.load(Ordering::SeqCst), 3);

        assert_eq!(buffer.get_or_fetch(9, &token).await, Ok(None));
        assert_eq!(pulls.load(Ordering::SeqCst), 6);
        assert!(buffer.is_complete());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_forks_single_enumeration() {
        let (stream, pulls) = counted_stream(100);
        let root = AsyncCursor::from_stream(stream);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fork = root.fork().into_stream(CancellationToken::new());
                tokio::spawn(async move { fork.collect::<Vec<_>>().await })
            })
            .collect();

        for handle in handles {
            let items: Result<Vec<_>, _> = handle.await.unwrap().into_iter().collect();
            assert_eq!(items.unwrap(), (1..=100).collect::<Vec<_>>());
        }
        assert_eq!(pulls.load(Ordering::SeqCst), 101);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_replayed_to_concurrent_and_late_forks() {
        let items = vec![Ok(1), Ok(2), Err("third failed"), Ok(4), Ok(5)];
        let root = AsyncCursor::from_results(stream::iter(items));

        let a = root.fork().into_stream(CancellationToken::new());
        let b = root.fork().into_stream(CancellationToken::new());
        let (a, b) = tokio::join!(
            tokio::spawn(a.collect::<Vec<_>>()),
            tokio::spawn(b.collect::<Vec<_>>())
        );

        let expected = vec![Ok(1), Ok(2), Err(ForkError::Upstream("third failed"))];
        assert_eq!(a.unwrap(), expected);
        assert_eq!(b.unwrap(), expected);

        let late: Vec<_> = root
            .fork()
            .into_stream(CancellationToken::new())
            .collect()
            .await;
        assert_eq!(late, expected);
    }

    #[tokio::test]
    async fn test_cancelled_before_pull() {
        let token = CancellationToken::new();
        token.cancel();
        let cursor = AsyncCursor::from_stream(stream::iter(vec![1]));

        assert_eq!(cursor.peek(&token).await, Err(ForkError::Cancelled));
        assert_eq!(cursor.buffer().buffered_len(), 0);

        // Cancellation is not cached.
        let fresh = CancellationToken::new();
        assert_eq!(cursor.peek(&fresh).await, Ok(Some(1)));
    }

    #[tokio::test]
    async fn test_waiter_cancel_does_not_cancel_initiator() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let cursor = AsyncCursor::from_stream(gated(vec![7], Arc::clone(&gate)));

        let initiator_token = CancellationToken::new();
        let initiator = {
            let cursor = cursor.fork();
            let token = initiator_token.clone();
            tokio::spawn(async move { cursor.peek(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter_token = CancellationToken::new();
        let waiter = {
            let cursor = cursor.fork();
            let token = waiter_token.clone();
            tokio::spawn(async move { cursor.peek(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        waiter_token.cancel();
        assert_eq!(waiter.await.unwrap(), Err(ForkError::Cancelled));

        gate.notify_one();
        assert_eq!(initiator.await.unwrap(), Ok(Some(7)));
    }

    #[tokio::test]
    async fn test_initiator_cancel_broadcasts_to_waiters() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let cursor = AsyncCursor::from_stream(gated(vec![7, 8], Arc::clone(&gate)));

        let initiator_token = CancellationToken::new();
        let initiator = {
            let cursor = cursor.fork();
            let token = initiator_token.clone();
            tokio::spawn(async move { cursor.peek(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let cursor = cursor.fork();
            tokio::spawn(async move { cursor.peek(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        initiator_token.cancel();
        assert_eq!(initiator.await.unwrap(), Err(ForkError::Cancelled));
        assert_eq!(waiter.await.unwrap(), Err(ForkError::Cancelled));
        #[cfg(feature = "stats")]
        assert_eq!(cursor.buffer().stats().cancelled_pulls(), 1);

        // The next request starts a new pull that picks up where the stream is.
        let retry = {
            let cursor = cursor.fork();
            tokio::spawn(async move { cursor.peek(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();
        assert_eq!(retry.await.unwrap(), Ok(Some(7)));
    }

    /// Sets its flag when the producer holding it is dropped.
    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn never_ready(dropped: Arc<AtomicBool>) -> impl Stream<Item = i32> + Send {
        let flag = DropFlag(dropped);
        stream::poll_fn(move |_| -> Poll<Option<i32>> {
            let _flag = &flag;
            Poll::Pending
        })
    }

    #[tokio::test]
    async fn test_buffer_freed_after_cancelled_fetch() {
        let dropped = Arc::new(AtomicBool::new(false));
        let cursor = AsyncCursor::from_stream(never_ready(Arc::clone(&dropped)));
        let weak = Arc::downgrade(cursor.buffer());

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(cursor.peek(&token).await, Err(ForkError::Cancelled));

        drop(cursor);
        assert!(weak.upgrade().is_none());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_buffer_freed_after_abandoned_fetch() {
        let dropped = Arc::new(AtomicBool::new(false));
        let cursor = AsyncCursor::from_stream(never_ready(Arc::clone(&dropped)));
        let weak = Arc::downgrade(cursor.buffer());

        let token = CancellationToken::new();
        let timed_out = tokio::time::timeout(Duration::from_millis(10), cursor.peek(&token)).await;
        assert!(timed_out.is_err());

        // The initiator is gone but its pull is still registered; a fork can join it.
        let fork = cursor.fork();
        let timed_out = tokio::time::timeout(Duration::from_millis(10), fork.peek(&token)).await;
        assert!(timed_out.is_err());

        drop(cursor);
        drop(fork);
        assert!(weak.upgrade().is_none());
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_initiator_cancel_mid_pull_keeps_source_order() {
        for _ in 0..50 {
            let initiator_token = CancellationToken::new();
            let trigger = initiator_token.clone();
            let mut produced = 0;
            // Cancels the initiator while it is inside the producer, then yields.
            let producer = stream::poll_fn(move |_| {
                if produced == 0 {
                    trigger.cancel();
                    std::thread::sleep(Duration::from_millis(1));
                }
                produced += 1;
                Poll::Ready((produced <= 3).then_some(produced))
            });
            let cursor = AsyncCursor::from_stream(producer);

            let initiator = {
                let cursor = cursor.fork();
                let token = initiator_token.clone();
                tokio::spawn(async move { cursor.peek(&token).await })
            };
            let follower = {
                let cursor = cursor.fork();
                let token = initiator_token.clone();
                tokio::spawn(async move {
                    token.cancelled().await;
                    cursor.lookahead(1, &CancellationToken::new()).await
                })
            };

            let _ = initiator.await.unwrap();
            assert_eq!(follower.await.unwrap(), Ok(Some(2)));

            let token = CancellationToken::new();
            assert_eq!(cursor.peek(&token).await, Ok(Some(1)));
            assert_eq!(cursor.lookahead(2, &token).await, Ok(Some(3)));
        }
    }

    #[tokio::test]
    async fn test_batch_yields_short_group_before_failure() {
        let token = CancellationToken::new();
        let items = vec![Ok(1), Ok(2), Ok(3), Err("boom"), Ok(5)];
        let cursor = AsyncCursor::from_results(stream::iter(items));

        let groups: Vec<_> = cursor.batch(2, &token).unwrap().collect().await;
        assert_eq!(
            groups,
            vec![
                Ok(vec![1, 2]),
                Ok(vec![3]),
                Err(ForkError::Upstream("boom"))
            ]
        );
    }

    #[tokio::test]
    async fn test_batches() {
        let token = CancellationToken::new();
        let cursor = AsyncCursor::from_stream(stream::iter(1..=5));

        let groups: Vec<_> = cursor.batch(2, &token).unwrap().collect().await;
        assert_eq!(groups, vec![Ok(vec![1, 2]), Ok(vec![3, 4]), Ok(vec![5])]);
        assert_eq!(cursor.is_exhausted(&token).await, Ok(false));
        assert_eq!(cursor.skip(5).is_exhausted(&token).await, Ok(true));
        assert!(matches!(
            cursor.batch(0, &token),
            Err(ForkError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_fork_stream_is_fused() {
        let mut fork = AsyncCursor::from_stream(stream::iter(vec![1, 2]))
            .into_stream(CancellationToken::new());

        assert!(!fork.is_terminated());
        assert_eq!(fork.next().await, Some(Ok(1)));
        assert_eq!(fork.position(), 1);
        assert_eq!(fork.next().await, Some(Ok(2)));
        assert_eq!(fork.next().await, None);
        assert!(fork.is_terminated());
        assert_eq!(fork.next().await, None);
    }

    #[test]
    fn test_send_sync_bounds() {
        static_assertions::assert_impl_all!(AsyncReplayBuffer<String>: Send, Sync);
        static_assertions::assert_impl_all!(AsyncCursor<String>: Send, Sync, Clone);
        static_assertions::assert_impl_all!(ForkStream<String>: Send);
    }
}
