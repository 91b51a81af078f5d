//! Thin layer over the platform allocator. Nothing here keeps any metadata;
//! that is the job of [`super::tracing::TrackingAlloc`].

use std::ptr::NonNull;

use crate::{error::AllocError, util::hint::cold};

/// Allocate `size` zeroed bytes with `malloc()`. A zero-sized request is
/// bumped to one byte so that a null return always means failure.
pub fn malloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    // SAFETY: `malloc()` has no preconditions, the result is checked below
    let data = unsafe { libc::malloc(size.max(1)) } as *mut u8;
    let Some(data) = NonNull::new(data) else {
        return cold(|| Err(AllocError::Exhausted { requested: size }));
    };
    // SAFETY:
    //   - `malloc()` guarantees the pointer is valid for writes of at least
    //     `size` bytes
    //   - Nobody else has seen this pointer yet
    unsafe {
        data.as_ptr().write_bytes(0, size);
    }
    Ok(data)
}

/// # Safety
///
/// - `data` must have been returned by [`malloc()`] and not freed since.
pub unsafe fn free(data: NonNull<u8>) {
    unsafe { libc::free(data.as_ptr() as *mut libc::c_void) }
}
