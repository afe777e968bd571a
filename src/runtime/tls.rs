//! Thread local storage of the runtime slot.
//! Encapsulated for an easy switch to a fast thread local.

use std::cell::RefCell;

/// Cache padded to avoid potential performance hit due to false sharing.
#[repr(align(128))]
struct Runtime(RefCell<super::RuntimeState>);

#[cfg(not(feature = "fast_thread_local"))]
thread_local! {
    /// Each thread gets its own independent runtime.
    static RUNTIME: Runtime = const { Runtime(RefCell::new(super::RuntimeState::new())) };
}

/// Borrow this thread's runtime.
/// Must not be held across a context switch.
#[cfg(not(feature = "fast_thread_local"))]
pub(super) fn runtime<T>(f: impl FnOnce(&mut super::RuntimeState) -> T) -> T {
    RUNTIME.with(|thread_local| {
        let mut cell = thread_local.0.borrow_mut();
        f(&mut cell)
    })
}

#[cfg(feature = "fast_thread_local")]
#[thread_local]
static RUNTIME: Runtime = Runtime(RefCell::new(super::RuntimeState::new()));

/// Borrow this thread's runtime.
/// Must not be held across a context switch.
#[cfg(feature = "fast_thread_local")]
pub(super) fn runtime<T>(f: impl FnOnce(&mut super::RuntimeState) -> T) -> T {
    let mut cell = RUNTIME.0.borrow_mut();
    f(&mut cell)
}
