//! Value-typed positions over a [`ReplayBuffer`].

use crate::buffer::ReplayBuffer;
use crate::error::{ensure_positive, ForkError, ForkResult};
use std::convert::Infallible;
use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;

/// An immutable position in a shared replay buffer.
///
/// A cursor is a buffer reference plus the index of the next unread item.
/// Advancing never mutates a cursor; [`Cursor::try_next`] hands back a new
/// one. Cloning is `O(1)` and the clone is independent from then on, which is
/// all [`Cursor::fork`] does.
///
/// ```
/// use stream_fork::Cursor;
///
/// let start = Cursor::from_values(vec!["a", "b", "c"]);
/// let (first, after) = start.try_next().unwrap();
/// assert_eq!(first, Some("a"));
/// assert_eq!(after.peek().unwrap(), Some("b"));
///
/// // `start` did not move.
/// assert_eq!(start.position(), 0);
/// assert_eq!(start.lookahead(2).unwrap(), Some("c"));
/// ```
pub struct Cursor<T, E = Infallible> {
    buffer: Arc<ReplayBuffer<T, E>>,
    position: usize,
}

impl<T, E> Clone for Cursor<T, E> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            position: self.position,
        }
    }
}

impl<T, E> fmt::Debug for Cursor<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("position", &self.position)
            .field("buffered", &self.buffer.buffered_len())
            .finish()
    }
}

impl<T, E> Cursor<T, E> {
    /// Creates a cursor at position 0 of `buffer`.
    pub fn new(buffer: Arc<ReplayBuffer<T, E>>) -> Self {
        Self::at(buffer, 0)
    }

    /// Creates a cursor at an arbitrary position of `buffer`.
    pub fn at(buffer: Arc<ReplayBuffer<T, E>>, position: usize) -> Self {
        Self { buffer, position }
    }

    /// Index of the next unread item.
    pub fn position(&self) -> usize {
        self.position
    }

    /// The shared buffer behind this cursor.
    pub fn buffer(&self) -> &Arc<ReplayBuffer<T, E>> {
        &self.buffer
    }

    /// Returns an independent copy at the same position.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Returns a cursor `n` positions further along without reading anything.
    pub fn skip(&self, n: usize) -> Self {
        Self::at(Arc::clone(&self.buffer), self.position.saturating_add(n))
    }

    /// Number of items the shared buffer has materialized so far.
    pub fn buffered_len(&self) -> usize {
        self.buffer.buffered_len()
    }

    /// Returns `true` if both cursors read from the same buffer.
    pub fn shares_buffer_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

impl<T, E> Cursor<T, E>
where
    T: Clone,
    E: Clone,
{
    /// Creates a cursor over a fresh buffer wrapping a fallible producer.
    pub fn from_results<I>(producer: I) -> Self
    where
        I: IntoIterator<Item = Result<T, E>>,
        I::IntoIter: Send + 'static,
        T: 'static,
        E: 'static,
    {
        Self::new(Arc::new(ReplayBuffer::new(producer)))
    }

    /// Returns the item at the current position without advancing.
    pub fn peek(&self) -> ForkResult<Option<T>, E> {
        self.buffer.get_or_fetch(self.position)
    }

    /// Returns the item `offset` positions ahead without advancing.
    ///
    /// `lookahead(0)` is [`peek`](Self::peek). Repeating a lookahead reads the
    /// memoized item and never grows the buffer further.
    pub fn lookahead(&self, offset: usize) -> ForkResult<Option<T>, E> {
        match self.position.checked_add(offset) {
            Some(index) => self.buffer.get_or_fetch(index),
            None => Err(ForkError::InvalidArgument("lookahead offset overflows position")),
        }
    }

    /// Reads the current item and returns it with a cursor advanced by one.
    ///
    /// At the end of the sequence the item is `None` and the returned cursor
    /// stays where it is.
    pub fn try_next(&self) -> ForkResult<(Option<T>, Self), E> {
        match self.peek()? {
            Some(item) => Ok((Some(item), self.skip(1))),
            None => Ok((None, self.clone())),
        }
    }

    /// Returns `true` if no item is left at the current position.
    pub fn is_exhausted(&self) -> ForkResult<bool, E> {
        Ok(self.peek()?.is_none())
    }

    /// Splits the remainder into consecutive groups of `size` items.
    ///
    /// The last group is shorter when the remainder does not divide evenly.
    /// Items read before a producer failure are yielded as a short group
    /// first; the failure follows as the next element.
    pub fn batch(&self, size: usize) -> ForkResult<Batches<T, E>, E> {
        let size = ensure_positive(size, "batch size must be greater than zero")?;
        Ok(Batches {
            cursor: self.clone(),
            size,
            done: false,
        })
    }

    /// Returns a one-shot traversal starting at the current position.
    ///
    /// The traversal owns its own copy of the cursor, so adapters like
    /// `filter` or `take` applied to it leave `self` untouched.
    pub fn as_sequence(&self) -> CursorIter<T, E> {
        CursorIter {
            cursor: self.clone(),
            done: false,
        }
    }
}

impl<T> Cursor<T, Infallible>
where
    T: Clone + 'static,
{
    /// Creates a cursor over a fresh buffer wrapping an infallible producer.
    pub fn from_values<I>(producer: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(Arc::new(ReplayBuffer::from_values(producer)))
    }
}

impl<T, E> IntoIterator for Cursor<T, E>
where
    T: Clone,
    E: Clone,
{
    type Item = ForkResult<T, E>;
    type IntoIter = CursorIter<T, E>;

    fn into_iter(self) -> Self::IntoIter {
        CursorIter {
            cursor: self,
            done: false,
        }
    }
}

/// One-shot traversal produced by [`Cursor::as_sequence`].
///
/// Yields `Ok` items until the end of the sequence. A producer failure is
/// yielded once as `Err`, after which the iterator is finished.
#[derive(Debug, Clone)]
pub struct CursorIter<T, E = Infallible> {
    cursor: Cursor<T, E>,
    done: bool,
}

impl<T, E> CursorIter<T, E> {
    /// Position of the next item this traversal would read.
    pub fn position(&self) -> usize {
        self.cursor.position
    }
}

impl<T, E> Iterator for CursorIter<T, E>
where
    T: Clone,
    E: Clone,
{
    type Item = ForkResult<T, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.peek() {
            Ok(Some(item)) => {
                self.cursor.position += 1;
                Some(Ok(item))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
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

impl<T, E> FusedIterator for CursorIter<T, E>
where
    T: Clone,
    E: Clone,
{
}

/// Consecutive, non-overlapping groups produced by [`Cursor::batch`].
#[derive(Debug, Clone)]
pub struct Batches<T, E = Infallible> {
    cursor: Cursor<T, E>,
    size: usize,
    done: bool,
}

impl<T, E> Iterator for Batches<T, E>
where
    T: Clone,
    E: Clone,
{
    type Item = ForkResult<Vec<T>, E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut group = Vec::with_capacity(self.size);
        while group.len() < self.size {
            match self.cursor.peek() {
                Ok(Some(item)) => {
                    group.push(item);
                    self.cursor.position += 1;
                }
                Ok(None) => {
                    self.done = true;
                    break;
                }
                Err(err) if group.is_empty() => {
                    self.done = true;
                    return Some(Err(err));
                }
                // The failure is cached, so the next call reports it.
                Err(_) => break,
            }
        }
        if group.is_empty() {
            None
        } else {
            Some(Ok(group))
        }
    }
}

impl<T, E> FusedIterator for Batches<T, E>
where
    T: Clone,
    E: Clone,
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counted(n: usize) -> (Cursor<usize>, Arc<AtomicUsize>) {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulls);
        let producer = (1..=n).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (Cursor::from_values(producer), pulls)
    }

    #[test]
    fn test_peek_does_not_advance() {
        let cursor = Cursor::from_values(vec![1, 2, 3]);
        assert_eq!(cursor.peek(), Ok(Some(1)));
        assert_eq!(cursor.peek(), Ok(Some(1)));
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_peek_on_empty_is_absent() {
        let cursor = Cursor::from_values(Vec::<i32>::new());
        assert_eq!(cursor.peek(), Ok(None));
        assert_eq!(cursor.is_exhausted(), Ok(true));
    }

    #[test]
    fn test_lookahead_is_idempotent() {
        let (cursor, pulls) = counted(10);

        assert_eq!(cursor.lookahead(3), Ok(Some(4)));
        let after_first = pulls.load(Ordering::SeqCst);
        assert_eq!(after_first, 4);

        assert_eq!(cursor.lookahead(3), Ok(Some(4)));
        assert_eq!(pulls.load(Ordering::SeqCst), after_first);
        assert_eq!(cursor.buffered_len(), 4);
    }

    #[test]
    fn test_lookahead_past_end() {
        let cursor = Cursor::from_values(vec![1, 2]);
        assert_eq!(cursor.lookahead(5), Ok(None));
        assert_eq!(cursor.lookahead(1), Ok(Some(2)));
    }

    #[test]
    fn test_lookahead_overflow_is_invalid() {
        let cursor = Cursor::from_values(vec![1]).skip(usize::MAX);
        assert!(matches!(
            cursor.lookahead(1),
            Err(ForkError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_try_next_returns_new_cursor() {
        let cursor = Cursor::from_values(vec![10, 20]);

        let (first, second) = cursor.try_next().unwrap();
        let (item, third) = second.try_next().unwrap();
        let (end, still_end) = third.try_next().unwrap();

        assert_eq!(first, Some(10));
        assert_eq!(item, Some(20));
        assert_eq!(end, None);
        assert_eq!(third.position(), 2);
        assert_eq!(still_end.position(), 2);
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn test_fork_is_independent() {
        let cursor = Cursor::from_values(1..=5);
        let (_, advanced) = cursor.try_next().unwrap();

        let fork = advanced.fork();
        let (_, fork_advanced) = fork.try_next().unwrap();
        let (_, fork_advanced) = fork_advanced.try_next().unwrap();

        assert_eq!(advanced.position(), 1);
        assert_eq!(fork.position(), 1);
        assert_eq!(fork_advanced.position(), 3);
        assert!(fork.shares_buffer_with(&cursor));
    }

    #[test]
    fn test_discarded_fork_leaves_parent_alone() {
        let cursor = Cursor::from_values(vec!['x', 'y']);
        let _ = cursor.fork().try_next().unwrap();
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.peek(), Ok(Some('x')));
    }

    #[test]
    fn test_as_sequence_snapshot() {
        let cursor = Cursor::from_values(1..=6);
        let evens: Vec<i32> = cursor
            .as_sequence()
            .filter_map(Result::ok)
            .filter(|n| n % 2 == 0)
            .take(2)
            .collect();

        assert_eq!(evens, vec![2, 4]);
        assert_eq!(cursor.position(), 0);

        let all: Result<Vec<_>, _> = cursor.as_sequence().collect();
        assert_eq!(all, Ok(vec![1, 2, 3, 4, 5, 6]));
    }

    #[test]
    fn test_sequence_stops_after_failure() {
        let cursor = Cursor::from_results(vec![Ok(1), Err("bad"), Ok(3)]);
        let mut seq = cursor.as_sequence();

        assert_eq!(seq.next(), Some(Ok(1)));
        assert_eq!(seq.next(), Some(Err(ForkError::Upstream("bad"))));
        assert_eq!(seq.next(), None);

        // A later fork replays the same failure.
        let replay: Vec<_> = cursor.fork().into_iter().collect();
        assert_eq!(replay, vec![Ok(1), Err(ForkError::Upstream("bad"))]);
    }

    #[test]
    fn test_batch_groups() {
        let cursor = Cursor::from_values(1..=7);
        let groups: Result<Vec<_>, _> = cursor.batch(3).unwrap().collect();
        assert_eq!(groups, Ok(vec![vec![1, 2, 3], vec![4, 5, 6], vec![7]]));

        let (_, advanced) = cursor.try_next().unwrap();
        let groups: Result<Vec<_>, _> = advanced.batch(2).unwrap().collect();
        assert_eq!(groups, Ok(vec![vec![2, 3], vec![4, 5], vec![6, 7]]));
    }

    #[test]
    fn test_batch_zero_is_invalid() {
        let cursor = Cursor::from_values(1..=3);
        assert!(matches!(
            cursor.batch(0),
            Err(ForkError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_batch_yields_short_group_before_failure() {
        let cursor = Cursor::from_results(vec![Ok(1), Ok(2), Ok(3), Err("boom"), Ok(5)]);
        let mut batches = cursor.batch(2).unwrap();

        assert_eq!(batches.next(), Some(Ok(vec![1, 2])));
        assert_eq!(batches.next(), Some(Ok(vec![3])));
        assert_eq!(batches.next(), Some(Err(ForkError::Upstream("boom"))));
        assert_eq!(batches.next(), None);
    }

    #[test]
    fn test_batch_on_empty() {
        let cursor = Cursor::from_values(Vec::<u8>::new());
        assert_eq!(cursor.batch(4).unwrap().count(), 0);
    }

    #[test]
    fn test_parallel_forks_single_enumeration() {
        let (cursor, pulls) = counted(500);

        std::thread::scope(|scope| {
            for _ in 0..6 {
                let fork = cursor.fork();
                scope.spawn(move || {
                    let items: Result<Vec<_>, _> = fork.into_iter().collect();
                    assert_eq!(items.unwrap().len(), 500);
                });
            }
        });

        // 500 items plus the pull that saw the end; the counter only sees items.
        assert_eq!(pulls.load(Ordering::SeqCst), 500);
        assert!(cursor.buffer().is_complete());
    }

    #[test]
    fn test_send_sync_bounds() {
        static_assertions::assert_impl_all!(Cursor<String>: Send, Sync, Clone);
        static_assertions::assert_impl_all!(CursorIter<String>: Send);
    }
}
