//! A library for reading one expensive iterator or stream from many independent consumers.
//!
//! The producer is wrapped in a [`ReplayBuffer`] (or [`AsyncReplayBuffer`]) that
//! pulls each item once, on demand, and remembers it. [`Cursor`]s, [`Flow`]
//! forks and [`windows`] read from that buffer without asking the producer for
//! an item twice.
//!
//! # Examples
//!
//! ```
//! use stream_fork::Flow;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let pulls = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&pulls);
//! let source = (1..=6).inspect(move |_| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! let shared = Flow::from_values(source).share();
//! let tens = shared.fork().map(|n| n * 10).collect_vec().unwrap();
//! let odds = shared.fork().filter(|n| n % 2 == 1).collect_vec().unwrap();
//!
//! assert_eq!(tens, vec![10, 20, 30, 40, 50, 60]);
//! assert_eq!(odds, vec![1, 3, 5]);
//! assert_eq!(pulls.load(Ordering::SeqCst), 6);
//! ```
//!
//! # Failures
//!
//! A producer failure is stored at the index where it happened and replayed to
//! every consumer that reaches it as [`ForkError::Upstream`]. It is never
//! retried.
//!
//! ```
//! use stream_fork::{ForkError, SharedFlow};
//!
//! let shared = SharedFlow::new(vec![Ok(1), Ok(2), Err("disk"), Ok(4)]);
//! for _ in 0..2 {
//!     let seen: Vec<_> = shared.fork().into_iter().collect();
//!     assert_eq!(seen, vec![Ok(1), Ok(2), Err(ForkError::Upstream("disk"))]);
//! }
//! ```
//!
//! # Thread Safety
//!
//! Buffers, cursors and shared flows are [`Send`] and [`Sync`] when the items
//! and errors are [`Send`]. Every consumer receives its own clone of an item,
//! so prefer cheap-to-clone items (consider `Arc<T>` for large data).
//!
//! Upstream pulls are reported through [`tracing`] at `trace` level.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

mod async_buffer;
mod async_flow;
mod buffer;
mod cursor;
mod error;
mod ext;
mod flow;
#[cfg(feature = "stats")]
mod stats;
mod window;

pub use async_buffer::{AsyncCursor, AsyncReplayBuffer, ForkStream};
pub use async_flow::{AsyncFlow, SharedAsyncFlow};
pub use buffer::ReplayBuffer;
pub use cursor::{Batches, Cursor, CursorIter};
pub use error::{ForkError, ForkResult};
pub use ext::{ForkIteratorExt, ForkStreamExt};
pub use flow::{Flow, FlowIter, SharedFlow};
#[cfg(feature = "stats")]
pub use stats::Stats;
pub use window::{windows, windows_ref, Window, WindowOptions, Windows, WindowsRef};
