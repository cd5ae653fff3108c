//! Synchronous replay buffer.
//!
//! A [`ReplayBuffer`] owns a single producer and memoizes everything it yields
//! by index. Any number of threads may ask for any index; the producer is only
//! ever advanced by one of them at a time and never twice for the same index.

use crate::error::{ForkError, ForkResult};
use std::convert::Infallible;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

pub(crate) type BoxIter<T, E> = Box<dyn Iterator<Item = ForkResult<T, E>> + Send>;

/// What is known about the end of the producer.
///
/// The terminal index is always `items.len()`: once recorded, no further item
/// is ever appended.
#[derive(Debug, Clone)]
pub(crate) enum Terminal<E> {
    Open,
    Exhausted,
    Failed(ForkError<E>),
}

struct State<T, E> {
    items: Vec<T>,
    terminal: Terminal<E>,
    // Set while exactly one caller is advancing the producer.
    fetching: bool,
}

/// A lazily filled, append-only store over one pull-based producer.
///
/// Use [`ReplayBuffer::new`] for producers yielding `Result<T, E>` and
/// [`ReplayBuffer::from_values`] for infallible ones. Buffers are normally
/// wrapped in an [`Arc`](std::sync::Arc) and read through a
/// [`Cursor`](crate::Cursor).
///
/// ```
/// use stream_fork::ReplayBuffer;
///
/// let buffer = ReplayBuffer::from_values(vec![1, 2, 3]);
/// assert_eq!(buffer.get_or_fetch(1), Ok(Some(2)));
/// assert_eq!(buffer.buffered_len(), 2);
/// assert_eq!(buffer.get_or_fetch(0), Ok(Some(1)));
/// assert_eq!(buffer.get_or_fetch(3), Ok(None));
/// ```
pub struct ReplayBuffer<T, E = Infallible> {
    state: Mutex<State<T, E>>,
    ready: Condvar,
    // Only touched by the caller holding `fetching`; dropped at the terminal.
    producer: Mutex<Option<BoxIter<T, E>>>,
    #[cfg(feature = "stats")]
    stats: crate::stats::Stats,
}

impl<T, E> ReplayBuffer<T, E>
where
    T: Clone,
    E: Clone,
{
    /// Creates a buffer over a fallible producer.
    ///
    /// Nothing is pulled until the first index is requested.
    pub fn new<I>(producer: I) -> Self
    where
        I: IntoIterator<Item = Result<T, E>>,
        I::IntoIter: Send + 'static,
        T: 'static,
        E: 'static,
    {
        Self::from_boxed(Box::new(
            producer.into_iter().map(|item| item.map_err(ForkError::Upstream)),
        ))
    }

    pub(crate) fn from_boxed(producer: BoxIter<T, E>) -> Self {
        Self {
            state: Mutex::new(State {
                items: Vec::new(),
                terminal: Terminal::Open,
                fetching: false,
            }),
            ready: Condvar::new(),
            producer: Mutex::new(Some(producer)),
            #[cfg(feature = "stats")]
            stats: crate::stats::Stats::new(),
        }
    }

    /// Returns the item at `index`, advancing the producer only as far as needed.
    ///
    /// `Ok(None)` means the sequence ended before `index`. A producer failure
    /// is cached at the index where it happened and returned to every caller
    /// reaching that index or beyond.
    ///
    /// If another thread is already advancing the producer, this call waits
    /// for that advance instead of pulling itself.
    pub fn get_or_fetch(&self, index: usize) -> ForkResult<Option<T>, E> {
        let mut state = self.lock_state();
        loop {
            if let Some(item) = state.items.get(index) {
                return Ok(Some(item.clone()));
            }
            match &state.terminal {
                Terminal::Exhausted => return Ok(None),
                Terminal::Failed(err) => return Err(err.clone()),
                Terminal::Open => {}
            }
            if state.fetching {
                state = self
                    .ready
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            state.fetching = true;
            let next_index = state.items.len();
            drop(state);

            let reset = FetchReset { buffer: self };
            let pulled = self.pull(next_index);
            std::mem::forget(reset);

            state = self.lock_state();
            state.fetching = false;
            self.record(&mut state, next_index, pulled);
            self.ready.notify_all();
        }
    }

    fn pull(&self, index: usize) -> Option<ForkResult<T, E>> {
        trace!(index, "pulling from upstream iterator");
        let mut producer = self.producer.lock().unwrap_or_else(PoisonError::into_inner);
        let pulled = producer.as_mut().and_then(|iter| iter.next());
        if !matches!(pulled, Some(Ok(_))) {
            producer.take();
        }
        #[cfg(feature = "stats")]
        self.stats.record_pull();
        pulled
    }

    fn record(&self, state: &mut State<T, E>, index: usize, pulled: Option<ForkResult<T, E>>) {
        match pulled {
            Some(Ok(item)) => state.items.push(item),
            Some(Err(err)) => {
                debug!(index, "upstream failed, caching failure");
                state.terminal = Terminal::Failed(err);
            }
            None => {
                debug!(len = index, "upstream exhausted");
                state.terminal = Terminal::Exhausted;
            }
        }
    }
}

impl<T, E> ReplayBuffer<T, E> {
    fn lock_state(&self) -> MutexGuard<'_, State<T, E>> {
        // Cells are append-only, so a panic elsewhere never leaves them torn.
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
    ///
    /// ```
    /// use stream_fork::ReplayBuffer;
    ///
    /// let buffer = ReplayBuffer::from_values(vec!['a', 'b']);
    /// let stats = buffer.stats();
    /// buffer.get_or_fetch(5).unwrap();
    /// assert_eq!(stats.pulls(), 3); // two items and the end
    /// ```
    #[cfg(feature = "stats")]
    #[cfg_attr(docsrs, doc(cfg(feature = "stats")))]
    pub fn stats(&self) -> crate::stats::Stats {
        self.stats.clone()
    }
}

impl<T> ReplayBuffer<T, Infallible>
where
    T: Clone,
{
    /// Creates a buffer over an infallible producer.
    pub fn from_values<I>(producer: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: 'static,
    {
        Self::from_boxed(Box::new(producer.into_iter().map(Ok)))
    }
}

impl<T, E> fmt::Debug for ReplayBuffer<T, E>
where
    T: fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("ReplayBuffer")
            .field("items", &state.items)
            .field("terminal", &state.terminal)
            .field("fetching", &state.fetching)
            .finish_non_exhaustive()
    }
}

// Releases the fetch slot if the producer panics mid-pull, so waiters on
// other threads do not block forever.
struct FetchReset<'a, T, E> {
    buffer: &'a ReplayBuffer<T, E>,
}

impl<T, E> Drop for FetchReset<'_, T, E> {
    fn drop(&mut self) {
        let mut state = self.buffer.lock_state();
        state.fetching = false;
        self.buffer.ready.notify_all();
    }
}
