//! Stackful coroutines, explicitly resumed and suspended on a single thread.
//!
//! Each [Coroutine] owns a private stack. [Coroutine::resume] runs it on that stack until it calls [yield_now] or its
//! entry returns, then control comes back to the resumer. Every frame of a suspended coroutine stays untouched on its
//! stack, so a yield may happen at any call depth.

use std::any::Any;
use std::ptr::{self, NonNull};
use std::{ffi, fmt, hint, panic, process, thread};

pub use builder::Builder;
pub use stack::MIN_STACK_SIZE;

mod builder;
mod context_switch;
mod stack;
mod tls;

/// Stack size used when none is configured.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Outcome of [Coroutine::resume].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    /// Suspended at a [yield_now], resume again to continue.
    Waiting,
    /// Entry returned, no further resume has any effect.
    Done,
}

/// Why control arrived on the other side of a context switch.
#[repr(usize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Signal {
    Resume = 1,
    Yield = 2,
    Done = 3,
    /// Unwind the suspended stack instead of continuing.
    Unwind = 4,
}

impl Signal {
    fn from_raw(raw: usize) -> Self {
        match raw {
            1 => Signal::Resume,
            2 => Signal::Yield,
            3 => Signal::Done,
            4 => Signal::Unwind,
            _ => unreachable!("corrupted context switch signal {raw}"),
        }
    }
}

/// Panic payload unwinding a suspended coroutine that's being destroyed.
struct ForcedUnwind;

/// Single active coroutine slot of a thread.
/// Only valid during a resume, cleared again once it returns.
struct RuntimeState {
    running: Option<NonNull<CoroutineState>>,
    /// Saved context of whoever resumed [running], lives in the resumer's frame.
    caller: *mut context_switch::ExecutionContext,
}

impl RuntimeState {
    const fn new() -> Self {
        RuntimeState {
            running: None,
            caller: ptr::null_mut(),
        }
    }
}

enum Entry {
    Function { function: fn(usize) -> isize, argument: usize },
    Closure(Box<dyn FnOnce()>),
}

impl Entry {
    fn run(self) {
        match self {
            Entry::Function { function, argument } => {
                let output = function(argument);
                log::trace!("entry function returned {output}");
            }
            Entry::Closure(closure) => closure(),
        }
    }
}

/// Heap pinned so the suspended stack and the runtime slot can point into it.
struct CoroutineState {
    entry: Option<Entry>,
    stack: Option<stack::Stack>,
    context: context_switch::ExecutionContext,
    yielded: usize,
    is_started: bool,
    is_running: bool,
    is_finished: bool,
    panic: Option<Box<dyn Any + Send + 'static>>,
}

/// Unit of cooperative work with its own stack.
///
/// Doesn't run until the first [Coroutine::resume].
/// Neither [Send] nor [Sync], a coroutine lives and dies on the thread that created it.
///
/// ```
/// use spindle::{Coroutine, Status};
///
/// fn count(limit: usize) -> isize {
///     for i in 0..limit {
///         spindle::yield_now(i);
///     }
///     0
/// }
///
/// let mut coroutine = Coroutine::new(count, 2, 64 * 1024);
/// assert_eq!(coroutine.resume(), Status::Waiting);
/// assert_eq!(coroutine.last_yielded(), 0);
/// assert_eq!(coroutine.resume(), Status::Waiting);
/// assert_eq!(coroutine.last_yielded(), 1);
/// assert_eq!(coroutine.resume(), Status::Done);
/// ```
pub struct Coroutine {
    state: NonNull<CoroutineState>,
}

impl Coroutine {
    /// Creates a coroutine that calls [function] with [argument] on a private stack of [stack_size] bytes.
    ///
    /// # Aborts
    /// If the stack can't be allocated, see [Coroutine::try_new] to handle that instead.
    pub fn new(function: fn(usize) -> isize, argument: usize, stack_size: usize) -> Self {
        Self::try_new(function, argument, stack_size).unwrap_or_else(|error| fatal(error))
    }

    /// Fallible version of [Coroutine::new].
    pub fn try_new(function: fn(usize) -> isize, argument: usize, stack_size: usize) -> crate::Result<Self> {
        Builder::new().stack_size(stack_size).build(function, argument)
    }

    /// Creates a coroutine that calls [f] on a private stack of [stack_size] bytes.
    ///
    /// # Aborts
    /// If the stack can't be allocated, see [Builder::build_closure] to handle that instead.
    pub fn with_closure(f: impl FnOnce() + 'static, stack_size: usize) -> Self {
        Builder::new()
            .stack_size(stack_size)
            .build_closure(f)
            .unwrap_or_else(|error| fatal(error))
    }

    /// Configures the stack before creating a coroutine, see [Builder].
    pub fn builder() -> Builder {
        Builder::new()
    }

    fn from_parts(entry: Entry, stack: stack::Stack) -> Self {
        log::debug!(
            "creating coroutine with {} byte {} stack",
            stack.usable_size(),
            if stack.is_guarded() { "guarded" } else { "heap" },
        );

        let state = Box::new(CoroutineState {
            entry: Some(entry),
            stack: Some(stack),
            context: context_switch::ExecutionContext::empty(),
            yielded: 0,
            is_started: false,
            is_running: false,
            is_finished: false,
            panic: None,
        });

        Coroutine {
            state: NonNull::from(Box::leak(state)),
        }
    }

    /// Runs the coroutine until it yields or its entry returns.
    ///
    /// A finished or destroyed coroutine isn't run again and reports [Status::Done].
    ///
    /// # Panics
    /// Re-raises a panic of the coroutine's body, after which the coroutine is finished.
    pub fn resume(&mut self) -> Status {
        let state = self.state.as_ptr();

        unsafe {
            if (*state).is_finished || (*state).stack.is_none() {
                log::trace!("coroutine {state:p} has nothing left to run");
                return Status::Done;
            }
            assert!(!(*state).is_running, "coroutine {state:p} resumed while running");

            switch_to(self.state, Signal::Resume);

            if let Some(payload) = (*state).panic.take() {
                panic::resume_unwind(payload);
            }

            if (*state).is_finished {
                Status::Done
            } else {
                Status::Waiting
            }
        }
    }

    /// Releases the stack, calling it again does nothing.
    ///
    /// A suspended body is unwound from its last yield first, so everything on its stack gets dropped.
    ///
    /// # Panics
    /// Re-raises a panic of the body that escaped while unwinding it.
    pub fn destroy(&mut self) {
        if let Some(payload) = self.release() {
            panic::resume_unwind(payload);
        }
    }

    /// Unwinds a suspended body and frees the stack, handing back a panic that escaped the body.
    fn release(&mut self) -> Option<Box<dyn Any + Send + 'static>> {
        let state = self.state.as_ptr();

        unsafe {
            (*state).stack.as_ref()?;
            assert!(!(*state).is_running, "coroutine {state:p} destroyed while running");

            // a body that swallows the unwind and yields again gets unwound again
            while (*state).is_started && !(*state).is_finished {
                log::debug!("unwinding suspended coroutine {state:p}");
                switch_to(self.state, Signal::Unwind);
            }

            log::debug!("destroying coroutine {state:p}");
            (*state).entry = None;
            drop((*state).stack.take());

            (*state).panic.take()
        }
    }

    /// Value passed to the most recent [yield_now], zero before the first one.
    pub fn last_yielded(&self) -> usize {
        self.state().yielded
    }

    /// Whether the body was entered by a [Coroutine::resume].
    pub fn is_started(&self) -> bool {
        self.state().is_started
    }

    /// Whether the body left its stack for good, [Coroutine::destroy] unwinds a suspended one.
    pub fn is_finished(&self) -> bool {
        self.state().is_finished
    }

    /// Whether the stack was released, a destroyed coroutine always resumes as [Status::Done].
    pub fn is_destroyed(&self) -> bool {
        self.state().stack.is_none()
    }

    fn state(&self) -> &CoroutineState {
        // safety: only the coroutine itself mutates its state, while running, which takes &mut self
        unsafe { self.state.as_ref() }
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        let payload = self.release();
        drop(unsafe { Box::from_raw(self.state.as_ptr()) });

        if let Some(payload) = payload {
            if thread::panicking() {
                log::error!("discarding panic of a coroutine dropped while panicking");
            } else {
                panic::resume_unwind(payload);
            }
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Coroutine")
            .field("last_yielded", &state.yielded)
            .field("is_started", &state.is_started)
            .field("is_finished", &state.is_finished)
            .field("is_destroyed", &state.stack.is_none())
            .finish()
    }
}

/// A coroutine without a stack can't exist, there's nothing sensible to degrade to.
fn fatal(error: crate::Error) -> ! {
    log::error!("{error}");
    process::abort()
}

/// Runs [coroutine] on its own stack until it yields or returns.
/// Cold starts through [trampoline], otherwise restores the context saved by its last yield, handing it [resumption].
///
/// # Safety
/// [coroutine] must have a stack, not be finished, and not be running.
unsafe fn switch_to(coroutine: NonNull<CoroutineState>, resumption: Signal) {
    let state = coroutine.as_ptr();
    let mut caller = context_switch::ExecutionContext::empty();
    let caller: *mut context_switch::ExecutionContext = &mut caller;

    // nested resumes get their slot back afterwards
    let previous = tls::runtime(|runtime| {
        let previous = (runtime.running, runtime.caller);
        runtime.running = Some(coroutine);
        runtime.caller = caller;
        previous
    });
    (*state).is_running = true;

    let signal = if (*state).is_started {
        log::trace!(
            "switching to coroutine {state:p} with {resumption:?} at {:#x} with stack pointer {:#x}",
            (*state).context.instruction_pointer(),
            (*state).context.stack_pointer(),
        );
        context_switch::switch(caller, ptr::addr_of!((*state).context), resumption as usize)
    } else {
        debug_assert_eq!(resumption, Signal::Resume);
        let top = match &(*state).stack {
            Some(stack) => stack.top(),
            None => unreachable!("coroutine {state:p} has no stack"),
        };
        log::trace!("cold starting coroutine {state:p} at {top:p}");
        context_switch::invoke_on_stack(caller, top, trampoline, state.cast())
    };

    (*state).is_running = false;
    tls::runtime(|runtime| (runtime.running, runtime.caller) = previous);

    match Signal::from_raw(signal) {
        Signal::Yield => log::trace!("coroutine {state:p} yielded {}", (*state).yielded),
        Signal::Done => log::debug!("coroutine {state:p} finished"),
        Signal::Resume | Signal::Unwind => unreachable!("coroutine {state:p} resumed its own resumer"),
    }
}

/// First frame of every coroutine stack, entered through [context_switch::invoke_on_stack].
/// Never returns, it leaves the stack for good by restoring the resumer.
unsafe extern "C" fn trampoline(payload: *mut ffi::c_void) -> ! {
    let state = payload as *mut CoroutineState;

    if !(*state).is_started {
        (*state).is_started = true;

        if let Some(entry) = (*state).entry.take() {
            // unwinding can't cross the context switch
            let result = panic::catch_unwind(panic::AssertUnwindSafe(|| entry.run()));
            hint::black_box(&result); // keeps the result on this stack in release mode
            match result {
                Err(payload) if payload.is::<ForcedUnwind>() => log::trace!("coroutine {state:p} unwound"),
                Err(payload) => (*state).panic = Some(payload),
                Ok(()) => {}
            }
        }

        (*state).is_finished = true;
    }

    let caller = tls::runtime(|runtime| runtime.caller);
    context_switch::restore(caller, Signal::Done as usize)
}

/// Suspends the running coroutine, making [value] its last yielded value.
///
/// Returns once the coroutine is resumed, with every frame and local on its stack as it was.
/// Does nothing when no coroutine is running on this thread.
pub fn yield_now(value: usize) {
    let running = tls::runtime(|runtime| runtime.running.map(|running| (running, runtime.caller)));
    let Some((coroutine, caller)) = running else {
        log::trace!("yield of {value} outside of a coroutine ignored");
        return;
    };

    let state = coroutine.as_ptr();
    unsafe {
        (*state).yielded = value;
        let signal = context_switch::switch(ptr::addr_of_mut!((*state).context), caller, Signal::Yield as usize);

        match Signal::from_raw(signal) {
            Signal::Resume => {}
            // caught by the trampoline, skips the panic hook
            Signal::Unwind => panic::resume_unwind(Box::new(ForcedUnwind)),
            Signal::Yield | Signal::Done => unreachable!("coroutine {state:p} continued by {signal}"),
        }
    }
}

/// Whether [yield_now] would suspend, i.e. this is running on a coroutine's stack.
pub fn in_coroutine() -> bool {
    tls::runtime(|runtime| runtime.running.is_some())
}
