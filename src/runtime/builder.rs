use std::num::NonZeroUsize;

use super::stack::Stack;
use super::{Coroutine, Entry, DEFAULT_STACK_SIZE};

/// Configures how a [Coroutine]'s stack is provisioned.
///
/// ```
/// fn count(limit: usize) -> isize {
///     for i in 0..limit {
///         spindle::yield_now(i);
///     }
///     0
/// }
///
/// let coroutine = spindle::Coroutine::builder()
///     .stack_size(64 * 1024)
///     .guard_pages(1)
///     .build(count, 3)
///     .unwrap();
/// # drop(coroutine);
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    stack_size: usize,
    guard_pages: Option<NonZeroUsize>,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            stack_size: DEFAULT_STACK_SIZE,
            guard_pages: None,
        }
    }

    /// Usable bytes of stack, must exceed the body's deepest call depth.
    /// Overflow isn't detected without guard pages.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    /// Maps the stack with [pages] inaccessible pages below it, so overflowing faults instead of corrupting memory.
    /// Zero falls back to a plain heap stack.
    pub fn guard_pages(mut self, pages: usize) -> Self {
        self.guard_pages = NonZeroUsize::new(pages);
        self
    }

    /// Creates a coroutine that calls [function] with [argument] on its first resume.
    pub fn build(self, function: fn(usize) -> isize, argument: usize) -> crate::Result<Coroutine> {
        self.create(Entry::Function { function, argument })
    }

    /// Creates a coroutine that calls [f] on its first resume.
    pub fn build_closure(self, f: impl FnOnce() + 'static) -> crate::Result<Coroutine> {
        self.create(Entry::Closure(Box::new(f)))
    }

    fn create(self, entry: Entry) -> crate::Result<Coroutine> {
        let stack = match self.guard_pages {
            Some(guard_pages) => Stack::guarded(guard_pages, self.stack_size)?,
            None => Stack::new(self.stack_size)?,
        };

        Ok(Coroutine::from_parts(entry, stack))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{yield_now, Error, Status, MIN_STACK_SIZE};

    fn count_to(limit: usize) -> isize {
        for i in 0..limit {
            yield_now(i);
        }
        0
    }

    #[test]
    fn defaults_to_heap_stack() {
        let builder = Builder::default();

        assert_eq!(builder.stack_size, DEFAULT_STACK_SIZE);
        assert!(builder.guard_pages.is_none());
    }

    #[test]
    fn zero_guard_pages_means_none() {
        let builder = Builder::new().guard_pages(0);

        assert!(builder.guard_pages.is_none());
    }

    #[test]
    fn runs_on_guarded_stack() {
        let mut coroutine = Builder::new()
            .stack_size(16 * 1024)
            .guard_pages(1)
            .build(count_to, 2)
            .unwrap();

        assert_eq!(coroutine.resume(), Status::Waiting);
        assert_eq!(coroutine.resume(), Status::Waiting);
        assert_eq!(coroutine.resume(), Status::Done);
        assert_eq!(coroutine.last_yielded(), 1);
    }

    #[test]
    fn rejects_tiny_stack() {
        let result = Builder::new().stack_size(16).build(count_to, 2);

        assert!(matches!(result, Err(Error::StackTooSmall { minimum, .. }) if minimum == MIN_STACK_SIZE));
    }

    #[test]
    fn builds_closure() {
        let mut coroutine = Builder::new()
            .stack_size(MIN_STACK_SIZE * 4)
            .build_closure(|| yield_now(7))
            .unwrap();

        assert_eq!(coroutine.resume(), Status::Waiting);
        assert_eq!(coroutine.last_yielded(), 7);
        assert_eq!(coroutine.resume(), Status::Done);
    }
}
