//! Stackful coroutines for a single thread.
//!
//! Write sequential, blocking-style code per unit of work, and interleave many of them on one thread by explicitly
//! resuming and yielding. Switching is cooperative: a coroutine only gives up the thread at a [yield_now], and an
//! embedding event loop decides when to [resume](Coroutine::resume) it again.
//!
//! ```
//! use spindle::{Coroutine, Status};
//!
//! fn running_sum(limit: usize) -> isize {
//!     let mut sum = 0;
//!     for i in 0..limit {
//!         sum += i;
//!         spindle::yield_now(sum);
//!     }
//!     0
//! }
//!
//! let mut coroutine = Coroutine::new(running_sum, 10, spindle::DEFAULT_STACK_SIZE);
//! while coroutine.resume() == Status::Waiting {}
//! assert_eq!(coroutine.last_yielded(), 45);
//! ```

#![cfg_attr(feature = "fast_thread_local", feature(thread_local))]

use std::io;

pub mod runtime;

pub use runtime::{in_coroutine, yield_now, Builder, Coroutine, Status, DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

/// Everything that can go wrong provisioning a coroutine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Requested stack can't fit even the entry trampoline.
    #[error("stack of {requested} bytes is smaller than the minimum of {minimum} bytes")]
    StackTooSmall { requested: usize, minimum: usize },

    /// Memory for the stack couldn't be obtained.
    #[error("failed to allocate a {size} byte stack")]
    StackAllocation {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// Stack was mapped but its guard pages couldn't be protected.
    #[error("failed to protect stack guard pages")]
    GuardPages {
        #[source]
        source: io::Error,
    },
}

/// Result of provisioning a coroutine.
pub type Result<T> = std::result::Result<T, Error>;
