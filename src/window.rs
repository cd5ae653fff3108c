//! Fixed-size sliding and striding windows over any lazy sequence.

use crate::error::{ensure_positive, ForkError};
use std::borrow::Cow;
use std::convert::Infallible;
use std::fmt;
use std::iter::{Fuse, FusedIterator};
use std::ops::Index;

/// Options for [`windows`] and [`windows_ref`].
///
/// ```
/// use stream_fork::WindowOptions;
///
/// let options = WindowOptions::new(3).stride(2).include_partial(true);
/// assert_eq!(options.size, 3);
/// assert!(options.validate().is_ok());
/// assert!(WindowOptions::new(0).validate().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOptions {
    /// Items per full window.
    pub size: usize,
    /// Items to advance between consecutive windows.
    pub stride: usize,
    /// Emit the trailing items as a final partial window.
    pub include_partial: bool,
    /// Lend full windows out of a single reused buffer.
    pub reuse_buffer: bool,
}

impl WindowOptions {
    /// Sliding windows of `size` items with a stride of one.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            stride: 1,
            include_partial: false,
            reuse_buffer: false,
        }
    }

    /// Sets the stride.
    #[must_use]
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Sets whether a trailing partial window is emitted.
    #[must_use]
    pub fn include_partial(mut self, include_partial: bool) -> Self {
        self.include_partial = include_partial;
        self
    }

    /// Sets whether full windows share one backing buffer.
    #[must_use]
    pub fn reuse_buffer(mut self, reuse_buffer: bool) -> Self {
        self.reuse_buffer = reuse_buffer;
        self
    }

    /// Checks that `size` and `stride` are positive.
    pub fn validate(&self) -> Result<(), ForkError<Infallible>> {
        ensure_positive(self.size, "window size must be greater than zero")?;
        ensure_positive(self.stride, "window stride must be greater than zero")?;
        Ok(())
    }
}

/// A window of up to `size` items.
///
/// Full windows hold exactly `size` items. A partial window holds between one
/// and `size - 1` items and is always an owned copy. A window lent out of a
/// reused buffer borrows it, so it cannot outlive the next step of
/// [`WindowsRef`]; call [`to_vec`](Window::to_vec) or
/// [`into_owned`](Window::into_owned) to keep its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window<'a, T: Clone> {
    items: Cow<'a, [T]>,
    partial: bool,
}

impl<'a, T: Clone> Window<'a, T> {
    fn owned(items: Vec<T>, partial: bool) -> Self {
        Self {
            items: Cow::Owned(items),
            partial,
        }
    }

    fn borrowed(items: &'a [T]) -> Self {
        Self {
            items: Cow::Borrowed(items),
            partial: false,
        }
    }

    /// Number of items in this window.
    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` for the trailing partial window.
    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Returns `true` when the window borrows a buffer that the next step
    /// overwrites.
    pub fn is_buffer_reused(&self) -> bool {
        matches!(self.items, Cow::Borrowed(_))
    }

    /// Returns the item at `index`, or an invalid-argument error when
    /// `index >= count()`.
    pub fn get(&self, index: usize) -> Result<&T, ForkError<Infallible>> {
        self.items
            .get(index)
            .ok_or(ForkError::InvalidArgument("window index out of range"))
    }

    /// The items as a slice.
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Iterates the items in order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Copies the items out.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.to_vec()
    }

    /// Detaches the window from any reused buffer.
    pub fn into_owned(self) -> Window<'static, T>
    where
        T: 'static,
    {
        Window {
            items: Cow::Owned(self.items.into_owned()),
            partial: self.partial,
        }
    }
}

impl<T: Clone> Index<usize> for Window<'_, T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.items[index]
    }
}

impl<'w, T: Clone> IntoIterator for &'w Window<'_, T> {
    type Item = &'w T;
    type IntoIter = std::slice::Iter<'w, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// Lending window view created by [`windows_ref`].
///
/// ```
/// use stream_fork::{windows_ref, WindowOptions};
///
/// let mut view = windows_ref(1..=5, WindowOptions::new(3).reuse_buffer(true)).unwrap();
/// let mut sums = Vec::new();
/// while let Some(window) = view.next_window() {
///     assert!(window.is_buffer_reused());
///     sums.push(window.iter().sum::<i32>());
/// }
/// assert_eq!(sums, vec![6, 9, 12]);
/// ```
pub struct WindowsRef<I>
where
    I: Iterator,
{
    source: Fuse<I>,
    options: WindowOptions,
    buffer: Vec<I::Item>,
    // Items in `buffer` not yet part of any emitted window.
    fresh: usize,
    // Source items still to discard before refilling, when stride > size.
    skip: usize,
    // The last full window is still lent out; slide before the next one.
    slide_pending: bool,
    finished: bool,
}

impl<I> fmt::Debug for WindowsRef<I>
where
    I: Iterator + fmt::Debug,
    I::Item: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowsRef")
            .field("source", &self.source)
            .field("options", &self.options)
            .field("buffer", &self.buffer)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<I> WindowsRef<I>
where
    I: Iterator,
    I::Item: Clone,
{
    /// Advances to the next window.
    ///
    /// Full windows borrow the internal buffer when `reuse_buffer` is set and
    /// are fresh copies otherwise. The partial window is always a copy.
    pub fn next_window(&mut self) -> Option<Window<'_, I::Item>> {
        if self.finished {
            return None;
        }

        if self.slide_pending {
            self.slide_pending = false;
            let dropped = self.options.stride.min(self.options.size);
            self.buffer.drain(..dropped);
            self.skip = self.options.stride.saturating_sub(self.options.size);
            self.fresh = 0;
        }

        while self.buffer.len() < self.options.size {
            let Some(item) = self.source.next() else {
                self.finished = true;
                if self.options.include_partial && self.fresh > 0 {
                    let rest = std::mem::take(&mut self.buffer);
                    return Some(Window::owned(rest, true));
                }
                return None;
            };
            if self.skip > 0 {
                self.skip -= 1;
                continue;
            }
            self.buffer.push(item);
            self.fresh += 1;
        }

        self.slide_pending = true;
        if self.options.reuse_buffer {
            Some(Window::borrowed(&self.buffer))
        } else {
            Some(Window::owned(self.buffer.clone(), false))
        }
    }

    /// The options this view was built with.
    pub fn options(&self) -> WindowOptions {
        self.options
    }
}

/// Owned window iterator created by [`windows`].
pub struct Windows<I>
where
    I: Iterator,
{
    inner: WindowsRef<I>,
}

impl<I> fmt::Debug for Windows<I>
where
    I: Iterator + fmt::Debug,
    I::Item: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Windows").field("inner", &self.inner).finish()
    }
}

impl<I> Iterator for Windows<I>
where
    I: Iterator,
    I::Item: Clone + 'static,
{
    type Item = Window<'static, I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next_window().map(Window::into_owned)
    }
}

impl<I> FusedIterator for Windows<I>
where
    I: Iterator,
    I::Item: Clone + 'static,
{
}

/// Slides a window of `options.size` items over `source`.
///
/// Invalid options are rejected here, before anything is pulled. Every
/// window is an owned copy; `reuse_buffer` only takes effect with
/// [`windows_ref`].
///
/// ```
/// use stream_fork::{windows, WindowOptions};
///
/// let full: Vec<Vec<i32>> = windows(1..=7, WindowOptions::new(3).stride(2))
///     .unwrap()
///     .map(|w| w.to_vec())
///     .collect();
/// assert_eq!(full, vec![vec![1, 2, 3], vec![3, 4, 5], vec![5, 6, 7]]);
///
/// let tail: Vec<_> = windows(1..=4, WindowOptions::new(3).stride(2).include_partial(true))
///     .unwrap()
///     .collect();
/// assert_eq!(tail[1].to_vec(), vec![3, 4]);
/// assert!(tail[1].is_partial());
/// ```
pub fn windows<S>(
    source: S,
    options: WindowOptions,
) -> Result<Windows<S::IntoIter>, ForkError<Infallible>>
where
    S: IntoIterator,
    S::Item: Clone + 'static,
{
    Ok(Windows {
        inner: windows_ref(source, options)?,
    })
}

/// Lending variant of [`windows`] that honours `reuse_buffer`.
pub fn windows_ref<S>(
    source: S,
    options: WindowOptions,
) -> Result<WindowsRef<S::IntoIter>, ForkError<Infallible>>
where
    S: IntoIterator,
    S::Item: Clone,
{
    options.validate()?;
    Ok(WindowsRef {
        source: source.into_iter().fuse(),
        options,
        buffer: Vec::with_capacity(options.size),
        fresh: 0,
        skip: 0,
        slide_pending: false,
        finished: false,
    })
}
