//! Tracked allocation for the shoe inventory program.
//!
//! [`alloc::TrackingAlloc`] hands out blocks that stay on a tracking list
//! until they are released, one at a time or all at once.
//! [`alloc::PtrStack`] is a doubling stack of handles built on the same
//! allocator, and [`record`] stores shoe records field by field on top of
//! both.

pub mod alloc;
pub mod error;
pub mod record;
mod serialize;
pub mod util;
