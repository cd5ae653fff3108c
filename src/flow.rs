//! Deferred, composable pipelines over one-shot or shared sources.

use crate::buffer::{BoxIter, ReplayBuffer};
use crate::cursor::Cursor;
use crate::error::{ensure_positive, ForkError, ForkResult};
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

type Build<T, E> = Box<dyn FnOnce() -> BoxIter<T, E> + Send>;

/// A lazily evaluated pipeline.
///
/// Stages added with [`map`](Flow::map), [`filter`](Flow::filter),
/// [`flat_map`](Flow::flat_map) and [`tap`](Flow::tap) only describe work.
/// Nothing is pulled from the source until a terminal operation
/// ([`collect_vec`](Flow::collect_vec), [`fold`](Flow::fold),
/// [`first_as_option`](Flow::first_as_option) or plain iteration) runs, and
/// then only as many items as that operation needs.
///
/// A flow is single-use. Call [`share`](Flow::share) to get a
/// [`SharedFlow`] that hands out independent forks over one buffered source.
///
/// ```
/// use stream_fork::Flow;
///
/// let total = Flow::from_values(1..=4)
///     .map(|n| n * n)
///     .filter(|n| n % 2 == 0)
///     .fold(0, |acc, n| acc + n)
///     .unwrap();
/// assert_eq!(total, 4 + 16);
/// ```
pub struct Flow<T, E = Infallible> {
    build: Build<T, E>,
    // Set while the flow is an untouched fork, so re-sharing reuses the buffer.
    root: Option<Cursor<T, E>>,
}

impl<T, E> fmt::Debug for Flow<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("shared_root", &self.root)
            .finish_non_exhaustive()
    }
}

impl<T, E> Flow<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Creates a flow over a fallible one-shot source.
    pub fn new<I>(source: I) -> Self
    where
        I: IntoIterator<Item = Result<T, E>> + Send + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::defer(move || Box::new(source.into_iter().map(|item| item.map_err(ForkError::Upstream))))
    }

    fn defer<F>(build: F) -> Self
    where
        F: FnOnce() -> BoxIter<T, E> + Send + 'static,
    {
        Self {
            build: Box::new(build),
            root: None,
        }
    }

    fn into_boxed(self) -> BoxIter<T, E> {
        (self.build)()
    }

    /// Transforms every item.
    pub fn map<U, F>(self, mut f: F) -> Flow<U, E>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        Flow::defer(move || Box::new(self.into_boxed().map(move |item| item.map(&mut f))))
    }

    /// Keeps the items matching `predicate`. Failures always pass through.
    pub fn filter<P>(self, mut predicate: P) -> Self
    where
        P: FnMut(&T) -> bool + Send + 'static,
    {
        Self::defer(move || {
            Box::new(self.into_boxed().filter(move |item| match item {
                Ok(value) => predicate(value),
                Err(_) => true,
            }))
        })
    }

    /// Replaces every item with the items `f` expands it into.
    pub fn flat_map<U, I, F>(self, mut f: F) -> Flow<U, E>
    where
        U: Send + 'static,
        I: IntoIterator<Item = U>,
        I::IntoIter: Send + 'static,
        F: FnMut(T) -> I + Send + 'static,
    {
        Flow::defer(move || {
            Box::new(self.into_boxed().flat_map(move |item| -> BoxIter<U, E> {
                match item {
                    Ok(value) => Box::new(f(value).into_iter().map(Ok)),
                    Err(err) => Box::new(std::iter::once(Err(err))),
                }
            }))
        })
    }

    /// Runs `side_effect` on every item as it flows past.
    pub fn tap<F>(self, mut side_effect: F) -> Self
    where
        F: FnMut(&T) + Send + 'static,
    {
        Self::defer(move || {
            Box::new(self.into_boxed().inspect(move |item| {
                if let Ok(value) = item {
                    side_effect(value);
                }
            }))
        })
    }

    /// Stops after `n` items.
    pub fn take(self, n: usize) -> Self {
        Self::defer(move || Box::new(self.into_boxed().take(n)))
    }

    /// Drains the flow into a vector, stopping at the first failure.
    pub fn collect_vec(self) -> ForkResult<Vec<T>, E> {
        self.into_iter().collect()
    }

    /// Folds every item into an accumulator, stopping at the first failure.
    pub fn fold<A, F>(self, seed: A, mut combiner: F) -> ForkResult<A, E>
    where
        F: FnMut(A, T) -> A,
    {
        self.into_iter()
            .try_fold(seed, |acc, item| item.map(|value| combiner(acc, value)))
    }

    /// Returns the first item and stops pulling.
    pub fn first_as_option(self) -> ForkResult<Option<T>, E> {
        self.into_iter().next().transpose()
    }
}

impl<T, E> Flow<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a flow reading `cursor` from its current position.
    pub fn from_cursor(cursor: Cursor<T, E>) -> Self {
        let root = cursor.clone();
        Self {
            build: Box::new(move || -> BoxIter<T, E> { Box::new(cursor.into_iter()) }),
            root: Some(root),
        }
    }

    /// Buffers this flow so it can be forked.
    ///
    /// The stages described so far become the producer of a new
    /// [`ReplayBuffer`]. Sharing an untouched fork, or a flow built with
    /// [`from_cursor`](Flow::from_cursor), reuses the existing buffer and keeps
    /// the cursor's position as the root of every later fork.
    pub fn share(self) -> SharedFlow<T, E> {
        match self.root {
            Some(root) => SharedFlow { root },
            None => SharedFlow {
                root: Cursor::new(Arc::new(ReplayBuffer::from_boxed((self.build)()))),
            },
        }
    }
}

impl<T> Flow<T, Infallible>
where
    T: Send + 'static,
{
    /// Creates a flow over an infallible one-shot source.
    pub fn from_values<I>(source: I) -> Self
    where
        I: IntoIterator<Item = T> + Send + 'static,
        I::IntoIter: Send + 'static,
    {
        Self::defer(move || Box::new(source.into_iter().map(Ok)))
    }
}

impl<T, E> IntoIterator for Flow<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    type Item = ForkResult<T, E>;
    type IntoIter = FlowIter<T, E>;

    fn into_iter(self) -> Self::IntoIter {
        FlowIter {
            inner: self.into_boxed(),
        }
    }
}

/// The traversal that drives a [`Flow`].
pub struct FlowIter<T, E = Infallible> {
    inner: BoxIter<T, E>,
}

impl<T, E> Iterator for FlowIter<T, E> {
    type Item = ForkResult<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<T, E> fmt::Debug for FlowIter<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowIter").finish_non_exhaustive()
    }
}

/// A flow whose source is buffered and can be read by many forks.
///
/// Every fork starts at the shared root (position 0 unless the flow was built
/// from an advanced cursor) and moves independently. The source itself is
/// still pulled at most once per item.
///
/// ```
/// use stream_fork::Flow;
///
/// let shared = Flow::from_values(1..=6).share();
/// let tens = shared.fork().map(|n| n * 10).collect_vec().unwrap();
/// let odds = shared.fork().filter(|n| n % 2 == 1).collect_vec().unwrap();
///
/// assert_eq!(tens, vec![10, 20, 30, 40, 50, 60]);
/// assert_eq!(odds, vec![1, 3, 5]);
/// ```
pub struct SharedFlow<T, E = Infallible> {
    root: Cursor<T, E>,
}

impl<T, E> Clone for SharedFlow<T, E> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
        }
    }
}

impl<T, E> fmt::Debug for SharedFlow<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedFlow").field("root", &self.root).finish()
    }
}

impl<T, E> SharedFlow<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Buffers a fallible source directly.
    pub fn new<I>(source: I) -> Self
    where
        I: IntoIterator<Item = Result<T, E>>,
        I::IntoIter: Send + 'static,
    {
        Self {
            root: Cursor::from_results(source),
        }
    }

    /// Returns an independent flow reading from the shared root position.
    pub fn fork(&self) -> Flow<T, E> {
        Flow::from_cursor(self.root.clone())
    }

    /// Returns `n` independent forks.
    pub fn fork_n(&self, n: usize) -> ForkResult<Vec<Flow<T, E>>, E> {
        let n = ensure_positive(n, "fork count must be at least one")?;
        Ok((0..n).map(|_| self.fork()).collect())
    }

    /// Splits into a fork of the items matching `predicate` and a fork of the
    /// rest. Both read the same buffer, so the source is pulled once in total.
    pub fn branch<P>(&self, predicate: P) -> (Flow<T, E>, Flow<T, E>)
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
    pub fn cursor(&self) -> Cursor<T, E> {
        self.root.clone()
    }

    /// The buffer behind every fork of this flow.
    pub fn buffer(&self) -> &Arc<ReplayBuffer<T, E>> {
        self.root.buffer()
    }
}

impl<T> SharedFlow<T, Infallible>
where
    T: Clone + Send + 'static,
{
    /// Buffers an infallible source directly.
    pub fn from_values<I>(source: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self {
            root: Cursor::from_values(source),
        }
    }
}
