//! Deferred pipelines over async sources, with cancellation at every pull.

use crate::async_buffer::{AsyncCursor, AsyncReplayBuffer};
use crate::error::{ensure_positive, ForkError, ForkResult};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use std::convert::Infallible;
use std::fmt;
use std::future::ready;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type Build<T, E> =
    Box<dyn FnOnce(CancellationToken) -> BoxStream<'static, ForkResult<T, E>> + Send>;

/// Async counterpart of [`Flow`](crate::Flow).
///
/// Stages describe work; the source is only polled once a terminal operation
/// runs. Terminal operations take a [`CancellationToken`] and resolve to
/// [`ForkError::Cancelled`] as soon as it fires.
///
/// ```
/// use stream_fork::AsyncFlow;
/// use futures_util::stream;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let token = CancellationToken::new();
/// let shared = AsyncFlow::from_stream(stream::iter(1..=6)).share();
///
/// let tens = shared.fork().map(|n| n * 10).collect_vec(&token);
/// let odds = shared.fork().filter(|n| n % 2 == 1).collect_vec(&token);
/// let (tens, odds) = tokio::join!(tens, odds);
///
/// assert_eq!(tens.unwrap(), vec![10, 20, 30, 40, 50, 60]);
/// assert_eq!(odds.unwrap(), vec![1, 3, 5]);
/// # });
/// ```
pub struct AsyncFlow<T, E = Infallible> {
    build: Build<T, E>,
    // Set while the flow is an untouched fork, so re-sharing reuses the buffer.
    root: Option<AsyncCursor<T, E>>,
}

impl<T, E> fmt::Debug for AsyncFlow<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFlow")
            .field("shared_root", &self.root)
            .finish_non_exhaustive()
    }
}

impl<T, E> AsyncFlow<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a flow over a fallible one-shot stream.
    pub fn new<S>(source: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        Self::defer(move |_| source.map(|item| item.map_err(ForkError::Upstream)).boxed())
    }

    fn defer<F>(build: F) -> Self
    where
        F: FnOnce(CancellationToken) -> BoxStream<'static, ForkResult<T, E>> + Send + 'static,
    {
        Self {
            build: Box::new(build),
            root: None,
        }
    }

    /// Transforms every item.
    pub fn map<U, F>(self, mut f: F) -> AsyncFlow<U, E>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        AsyncFlow::defer(move |token| {
            (self.build)(token)
                .map(move |item| item.map(&mut f))
                .boxed()
        })
    }

    /// Keeps the items matching `predicate`. Failures always pass through.
    pub fn filter<P>(self, mut predicate: P) -> Self
    where
        P: FnMut(&T) -> bool + Send + 'static,
    {
        Self::defer(move |token| {
            (self.build)(token)
                .filter(move |item| {
                    ready(match item {
                        Ok(value) => predicate(value),
                        Err(_) => true,
                    })
                })
                .boxed()
        })
    }

    /// Replaces every item with the stream `f` expands it into.
    pub fn flat_map<U, S, F>(self, mut f: F) -> AsyncFlow<U, E>
    where
        U: Send + 'static,
        S: Stream<Item = U> + Send + 'static,
        F: FnMut(T) -> S + Send + 'static,
    {
        AsyncFlow::defer(move |token| {
            (self.build)(token)
                .flat_map(move |item| match item {
                    Ok(value) => f(value).map(Ok).left_stream(),
                    Err(err) => stream::once(ready(Err(err))).right_stream(),
                })
                .boxed()
        })
    }

    /// Runs `side_effect` on every item as it flows past.
    pub fn tap<F>(self, mut side_effect: F) -> Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        Self::defer(move |token| {
            (self.build)(token)
                .inspect(move |item| {
                    if let Ok(value) = item {
                        side_effect(value);
                    }
                })
                .boxed()
        })
    }

    /// Stops after `n` items.
    pub fn take(self, n: usize) -> Self {
        Self::defer(move |token| (self.build)(token).take(n).boxed())
    }

    /// Builds the stream this flow describes. `token` is checked on every pull
    /// from a shared buffer; terminal operations also race it at each step.
    pub fn into_stream(self, token: CancellationToken) -> BoxStream<'static, ForkResult<T, E>> {
        (self.build)(token)
    }

    /// Drains the flow into a vector, stopping at the first failure.
    pub async fn collect_vec(self, token: &CancellationToken) -> ForkResult<Vec<T>, E> {
        self.fold_async(
            Vec::new(),
            |mut items, item| {
                items.push(item);
                items
            },
            token,
        )
        .await
    }

    /// Folds every item into an accumulator, suspending at each pull.
    pub async fn fold_async<A, F>(
        self,
        seed: A,
        mut combiner: F,
        token: &CancellationToken,
    ) -> ForkResult<A, E>
    where
        F: FnMut(A, T) -> A,
    {
        let mut items = self.into_stream(token.clone());
        let mut acc = seed;
        while let Some(item) = next_or_cancel(&mut items, token).await? {
            acc = combiner(acc, item);
        }
        Ok(acc)
    }

    /// Returns the first item and stops pulling.
    pub async fn first_as_option_async(
        self,
        token: &CancellationToken,
    ) -> ForkResult<Option<T>, E> {
        let mut items = self.into_stream(token.clone());
        next_or_cancel(&mut items, token).await
    }
}

async fn next_or_cancel<T, E>(
    items: &mut BoxStream<'static, ForkResult<T, E>>,
    token: &CancellationToken,
) -> ForkResult<Option<T>, E> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(ForkError::Cancelled),
        next = items.next() => next.transpose(),
    }
}

impl<T, E> AsyncFlow<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a flow reading `cursor` from its current position.
    pub fn from_cursor(cursor: AsyncCursor<T, E>) -> Self {
        let root = cursor.clone();
        Self {
            build: Box::new(move |token: CancellationToken| cursor.into_stream(token).boxed()),
            root: Some(root),
        }
    }

    /// Buffers this flow so it can be forked.
    ///
    /// Sharing an untouched fork, or a flow built with
    /// [`from_cursor`](AsyncFlow::from_cursor), reuses the existing buffer and
    /// keeps the cursor's position as the root of every later fork. Otherwise the described stages become the producer of a new
    /// [`AsyncReplayBuffer`]; building that producer polls nothing.
    pub fn share(self) -> SharedAsyncFlow<T, E> {
        match self.root {
            Some(root) => SharedAsyncFlow { root },
            None => {
                // Cancellation is applied per consumer by the buffer, not here.
                let producer = (self.build)(CancellationToken::new());
                SharedAsyncFlow {
                    root: AsyncCursor::new(Arc::new(AsyncReplayBuffer::from_boxed(producer))),
                }
            }
        }
    }
}

impl<T> AsyncFlow<T, Infallible>
where
    T: Send + 'static,
{
    /// Creates a flow over an infallible one-shot stream.
    pub fn from_stream<S>(source: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self::defer(move |_| source.map(Ok).boxed())
    }
}

/// Async counterpart of [`SharedFlow`](crate::SharedFlow).
pub struct SharedAsyncFlow<T, E = Infallible> {
    root: AsyncCursor<T, E>,
}

impl<T, E> Clone for SharedAsyncFlow<T, E> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
        }
    }
}

impl<T, E> fmt::Debug for SharedAsyncFlow<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedAsyncFlow")
            .field("root", &self.root)
            .finish()
    }
}

impl<T, E> SharedAsyncFlow<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Buffers a fallible stream directly.
    pub fn new<S>(source: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        Self {
            root: AsyncCursor::from_results(source),
        }
    }

    /// Returns an independent flow reading from the shared root position.
    pub fn fork(&self) -> AsyncFlow<T, E> {
        AsyncFlow::from_cursor(self.root.clone())
    }

    /// Returns `n` independent forks.
    pub fn fork_n(&self, n: usize) -> ForkResult<Vec<AsyncFlow<T, E>>, E> {
        let n = ensure_positive(n, "fork count must be at least one")?;
        Ok((0..n).map(|_| self.fork()).collect())
    }

    /// Splits into a fork of the items matching `predicate` and a fork of the
    /// rest, both reading the same buffer.
    pub fn branch<P>(&self, predicate: P) -> (AsyncFlow<T, E>, AsyncFlow<T, E>)
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        let rejecting = Arc::clone(&predicate);
        let matched = self.fork().filter(move |item| predicate(item));
        let rest = self.fork().filter(move |item| !rejecting(item));
        (matched, rest)
    }

    /// Sharing an already shared flow hands back the same buffer.
    pub fn share(&self) -> Self {
        self.clone()
    }

    /// A cursor at the shared root position.
    pub fn cursor(&self) -> AsyncCursor<T, E> {
        self.root.clone()
    }

    /// The buffer behind every fork of this flow.
    pub fn buffer(&self) -> &Arc<AsyncReplayBuffer<T, E>> {
        self.root.buffer()
    }
}

impl<T> SharedAsyncFlow<T, Infallible>
where
    T: Clone + Send + 'static,
{
    /// Buffers an infallible stream directly.
    pub fn from_stream<S>(source: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self {
            root: AsyncCursor::from_stream(source),
        }
    }
}
