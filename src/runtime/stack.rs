//! Private stack memory of a coroutine.

use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::{ffi, io, ptr};

use super::context_switch::STACK_ALIGNMENT;
use crate::Error;

/// Smallest usable stack a coroutine may be created with.
pub const MIN_STACK_SIZE: usize = 4 * 1024;

/// Owner of a stack allocation.
/// The usable top is derived once from the allocation and is never handed out without it.
#[derive(Debug)]
pub(crate) struct Stack {
    pointer: NonNull<u8>,
    length: usize,
    top: NonNull<u8>,
    kind: Kind,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Kind {
    /// From `malloc`, freed through the original pointer.
    Heap,
    /// From `mmap`, lowest `guard_length` bytes are inaccessible.
    Mapped { guard_length: usize },
}

impl Stack {
    /// Allocates at least [size] usable bytes from the heap.
    /// Over-allocates by the alignment so the aligned top always lies within the allocation.
    pub(crate) fn new(size: usize) -> crate::Result<Self> {
        check_size(size)?;
        let length = size.checked_add(STACK_ALIGNMENT).ok_or_else(|| too_large(size))?;

        let pointer = unsafe { libc::malloc(length) } as *mut u8;
        let Some(pointer) = NonNull::new(pointer) else {
            let error = io::Error::last_os_error();
            return Err(Error::StackAllocation { size: length, source: error });
        };

        // highest aligned address not beyond base + size
        let top = unsafe {
            let end = pointer.as_ptr().add(size);
            NonNull::new_unchecked(end.sub(end as usize % STACK_ALIGNMENT))
        };

        Ok(Stack {
            pointer,
            length,
            top,
            kind: Kind::Heap,
        })
    }

    /// Maps a stack protected from overflow using guard pages.
    /// Demand paging ensures that physical memory is allocated only as necessary, during a page fault.
    pub(crate) fn guarded(guard_pages: NonZeroUsize, size: usize) -> crate::Result<Self> {
        check_size(size)?;

        // page aligned sizes
        let page_size = page_size();
        let usable_pages = size.div_ceil(page_size);
        let guard_length = guard_pages.get().checked_mul(page_size).ok_or_else(|| too_large(size))?;
        let length = usable_pages
            .checked_mul(page_size)
            .and_then(|usable| usable.checked_add(guard_length))
            .ok_or_else(|| too_large(size))?;

        // kernel allocates an unused block of virtual memory
        let pointer = unsafe {
            libc::mmap(
                ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if pointer == libc::MAP_FAILED {
            let error = io::Error::last_os_error();
            return Err(Error::StackAllocation { size: length, source: error });
        }

        // if guarding memory goes wrong then mmap gets cleaned up in Stack's drop
        let pointer = unsafe { NonNull::new_unchecked(pointer as *mut u8) };
        let stack = Stack {
            pointer,
            length,
            top: unsafe { NonNull::new_unchecked(pointer.as_ptr().add(length)) },
            kind: Kind::Mapped { guard_length },
        };

        // located at the lowest addresses since the stack grows downward
        let result = unsafe { libc::mprotect(pointer.as_ptr() as *mut ffi::c_void, guard_length, libc::PROT_NONE) };
        if result == -1 {
            let error = io::Error::last_os_error();
            return Err(Error::GuardPages { source: error });
        }

        Ok(stack)
    }

    /// Aligned upper end of the usable region, stack addresses grow downwards.
    pub(crate) fn top(&self) -> *mut u8 {
        self.top.as_ptr()
    }

    /// Bytes between the lowest usable address and the top.
    pub(crate) fn usable_size(&self) -> usize {
        let bottom = match self.kind {
            Kind::Heap => self.pointer.as_ptr() as usize,
            Kind::Mapped { guard_length } => self.pointer.as_ptr() as usize + guard_length,
        };
        self.top.as_ptr() as usize - bottom
    }

    pub(crate) fn is_guarded(&self) -> bool {
        matches!(self.kind, Kind::Mapped { .. })
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        match self.kind {
            Kind::Heap => unsafe { libc::free(self.pointer.as_ptr() as *mut ffi::c_void) },
            Kind::Mapped { .. } => {
                let result = unsafe { libc::munmap(self.pointer.as_ptr() as *mut ffi::c_void, self.length) };
                assert_eq!(result, 0);
            }
        }
    }
}

fn check_size(size: usize) -> crate::Result<()> {
    if size < MIN_STACK_SIZE {
        return Err(Error::StackTooSmall {
            requested: size,
            minimum: MIN_STACK_SIZE,
        });
    }

    Ok(())
}

fn too_large(size: usize) -> Error {
    Error::StackAllocation {
        size,
        source: io::ErrorKind::OutOfMemory.into(),
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
