//! Extension traits for turning iterators and streams into forkable sources.
//!
//! [`ForkIteratorExt`] and [`ForkStreamExt`] add `into_*` conversions to any
//! iterator or stream, the same way [`SharedFlow::new`] and friends do.

use crate::async_buffer::AsyncCursor;
use crate::async_flow::{AsyncFlow, SharedAsyncFlow};
use crate::cursor::Cursor;
use crate::error::ForkError;
use crate::flow::{Flow, SharedFlow};
use crate::window::{windows, WindowOptions, Windows};
use futures_util::stream::Stream;
use std::convert::Infallible;

/// Extension trait for [`Iterator`].
pub trait ForkIteratorExt: Iterator {
    /// Converts this iterator into a deferred, single-use [`Flow`].
    ///
    /// ```
    /// use stream_fork::ForkIteratorExt;
    ///
    /// let doubled = (1..=3).into_flow().map(|n| n * 2).collect_vec().unwrap();
    /// assert_eq!(doubled, vec![2, 4, 6]);
    /// ```
    fn into_flow(self) -> Flow<Self::Item>
    where
        Self: Sized + Send + 'static,
        Self::Item: Send + 'static,
    {
        Flow::from_values(self)
    }

    /// Buffers this iterator so it can be forked.
    ///
    /// ```
    /// use stream_fork::ForkIteratorExt;
    ///
    /// let shared = vec!["a", "b"].into_iter().into_shared();
    /// assert_eq!(shared.fork().collect_vec().unwrap(), vec!["a", "b"]);
    /// assert_eq!(shared.fork().collect_vec().unwrap(), vec!["a", "b"]);
    /// ```
    fn into_shared(self) -> SharedFlow<Self::Item>
    where
        Self: Sized + Send + 'static,
        Self::Item: Clone + Send + 'static,
    {
        SharedFlow::from_values(self)
    }

    /// Buffers this iterator behind a [`Cursor`] at position 0.
    fn into_cursor(self) -> Cursor<Self::Item>
    where
        Self: Sized + Send + 'static,
        Self::Item: Clone + 'static,
    {
        Cursor::from_values(self)
    }

    /// Slides windows over this iterator. See [`windows`].
    fn sliding_windows(self, options: WindowOptions) -> Result<Windows<Self>, ForkError<Infallible>>
    where
        Self: Sized,
        Self::Item: Clone + 'static,
    {
        windows(self, options)
    }
}

impl<I> ForkIteratorExt for I where I: Iterator {}

/// Extension trait for [`Stream`].
pub trait ForkStreamExt: Stream {
    /// Converts this stream into a deferred, single-use [`AsyncFlow`].
    fn into_async_flow(self) -> AsyncFlow<Self::Item>
    where
        Self: Sized + Send + 'static,
        Self::Item: Send + 'static,
    {
        AsyncFlow::from_stream(self)
    }

    /// Buffers this stream so it can be forked across tasks.
    ///
    /// ```
    /// use stream_fork::ForkStreamExt;
    /// use futures_util::stream;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// # tokio_test::block_on(async {
    /// let token = CancellationToken::new();
    /// let shared = stream::iter(vec![1, 2, 3]).into_shared_async();
    /// let (a, b) = tokio::join!(
    ///     shared.fork().collect_vec(&token),
    ///     shared.fork().collect_vec(&token),
    /// );
    /// assert_eq!(a.unwrap(), vec![1, 2, 3]);
    /// assert_eq!(b.unwrap(), vec![1, 2, 3]);
    /// # });
    /// ```
    fn into_shared_async(self) -> SharedAsyncFlow<Self::Item>
    where
        Self: Sized + Send + 'static,
        Self::Item: Clone + Send + 'static,
    {
        SharedAsyncFlow::from_stream(self)
    }

    /// Buffers this stream behind an [`AsyncCursor`] at position 0.
    fn into_async_cursor(self) -> AsyncCursor<Self::Item>
    where
        Self: Sized + Send + 'static,
        Self::Item: Clone + Send + 'static,
    {
        AsyncCursor::from_stream(self)
    }
}

impl<S> ForkStreamExt for S where S: Stream {}
