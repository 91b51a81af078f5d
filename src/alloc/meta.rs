//! Per-block metadata of the tracked allocator.
//!
//! Every tracked allocation looks like this in memory:
//!
//! ```plaintext
//! +--------------------+ <- returned by malloc()
//! | BlockHeader        |
//! | padding...         | HEADER_SIZE bytes
//! +--------------------+ <- Handle
//! | payload            | header.size - HEADER_SIZE bytes
//! +--------------------+
//! ```

use std::{fmt, mem, ptr::NonNull};

use serde::{Deserialize, Serialize};

use crate::{serialize::serde_usize, util::num::round_up};

/// Written into every header. A header without it is never unlinked or
/// freed.
pub const SIGNATURE: u64 = 0x5348_4f45_5f54_524b;

/// Distance from the start of a block to its payload. Rounded to 16 so the
/// payload keeps `malloc()`'s alignment.
pub const HEADER_SIZE: usize = round_up(mem::size_of::<BlockHeader>(), 16);

/// Header at the start of every tracked block. The links belong to the
/// tracking list, not to whoever owns the payload.
#[repr(C)]
pub(crate) struct BlockHeader {
    pub(crate) next: *mut BlockHeader,
    pub(crate) prev: *mut BlockHeader,
    pub(crate) signature: u64,
    /// Header plus payload, in bytes
    pub(crate) size: usize,
}

impl BlockHeader {
    pub(crate) fn payload(header: NonNull<BlockHeader>) -> Handle {
        // SAFETY: every header is followed by its payload in the same
        //         allocation, so this stays in bounds (or one past the end
        //         for empty payloads)
        Handle(unsafe { header.cast::<u8>().add(HEADER_SIZE) })
    }

    /// Where the header of `handle` would be, if `handle` were a tracked
    /// payload. Only dereference this once the registry has confirmed it.
    pub(crate) fn of(handle: Handle) -> *mut BlockHeader {
        handle.as_ptr().wrapping_sub(HEADER_SIZE) as *mut BlockHeader
    }

    pub(crate) fn payload_len(&self) -> usize {
        self.size - HEADER_SIZE
    }
}

/// A payload address issued by [`super::tracing::TrackingAlloc`], or any
/// other address a caller wants to offer back to it.
///
/// Constructing a handle is always safe: the allocator checks membership
/// before it reads anything behind it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle(NonNull<u8>);

impl Handle {
    /// `None` for the null pointer
    pub fn from_raw(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub const fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:p})", self.0)
    }
}

/// Outstanding totals of an allocator. `bytes` includes headers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocStats {
    pub blocks: usize,
    pub bytes: usize,
}

/// One live block as seen by [`super::tracing::TrackingAlloc::snapshot`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Payload address
    #[serde(with = "serde_usize")]
    pub address: *const (),
    /// Header plus payload, in bytes
    pub size: usize,
}
