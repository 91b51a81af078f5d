pub mod manual;
pub mod meta;
pub mod rawbuf;
pub mod tracing;

pub use meta::{AllocStats, BlockInfo, Handle, HEADER_SIZE, SIGNATURE};
pub use rawbuf::{PtrStack, INITIAL_ALLOTMENT};
pub use tracing::{Released, TrackingAlloc, TrackingConfig};
