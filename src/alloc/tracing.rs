//! A wrapper around `malloc()` that threads every allocation onto a doubly
//! linked list, so that everything still outstanding can be torn down in one
//! pass.
//!
//! The links live in each block's [`BlockHeader`], in front of the payload.
//! We can't trust an arbitrary address to have a header in front of it
//! though, so the payload addresses of live blocks are also kept in a side
//! table. A handle is only ever turned back into a header after the table
//! says it's ours, and the header's signature still has to match.

use std::{
    cell::{Ref, RefCell, RefMut},
    env, mem,
    ptr::{self, NonNull},
    slice,
};

use ahash::RandomState;
use bytemuck::Pod;
use hashbrown::HashSet;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use super::{
    manual,
    meta::{AllocStats, BlockHeader, BlockInfo, Handle, HEADER_SIZE, SIGNATURE},
};
use crate::{
    error::{AllocError, ConfigError},
    util::hint::cold,
};

/// Environment variable read by [`TrackingConfig::from_env()`]
pub const BYTE_LIMIT_VAR: &str = "INVTRACK_BYTE_LIMIT";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Refuse any allocation that would take the outstanding byte count
    /// (headers included) above this.
    pub byte_limit: Option<usize>,
}

impl TrackingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let byte_limit = match env::var(BYTE_LIMIT_VAR) {
            Ok(value) => Some(
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidByteLimit { value })?,
            ),
            Err(_) => None,
        };
        Ok(Self { byte_limit })
    }
}

/// What [`TrackingAlloc::release()`] did with the pointer it was given.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Released {
    /// There was no pointer, nothing happened
    Null,
    /// The block was unlinked and handed back to the platform allocator
    Freed,
    /// The pointer is not a live block of this allocator. Nothing was freed
    /// and the tracking list is untouched.
    Unregistered(Handle),
}

impl Released {
    /// The pointer the caller should keep holding: `None` once it is gone,
    /// the original handle if it was refused.
    pub fn remaining(self) -> Option<Handle> {
        match self {
            Released::Unregistered(handle) => Some(handle),
            Released::Null | Released::Freed => None,
        }
    }

    pub fn is_freed(self) -> bool {
        self == Released::Freed
    }
}

struct Registry {
    /// Most recently allocated block, null when nothing is live
    head: *mut BlockHeader,
    /// Payload addresses of every linked block
    live: HashSet<usize, RandomState>,
    blocks: usize,
    bytes: usize,
    /// Bumped by every bulk clear that released something
    epoch: u64,
}

impl Registry {
    fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            live: HashSet::with_hasher(RandomState::new()),
            blocks: 0,
            bytes: 0,
            epoch: 0,
        }
    }

    /// The header of `handle`, if it is a live block with an intact
    /// signature.
    fn header(&self, handle: Handle) -> Option<NonNull<BlockHeader>> {
        if !self.live.contains(&handle.addr()) {
            return None;
        }
        let header = BlockHeader::of(handle);
        // SAFETY: `handle` is in `live`, so `header` is a block we allocated
        //         and have not freed yet
        if unsafe { (*header).signature } != SIGNATURE {
            return cold(|| {
                warn!("block {handle:?} is registered but its signature is corrupt");
                None
            });
        }
        NonNull::new(header)
    }

    fn payload(&self, handle: Handle) -> Option<&[u8]> {
        let header = self.header(handle)?;
        // SAFETY:
        //   - the header was validated above and describes its own size
        //   - payload memory was zeroed on allocation, so it is initialized
        //   - the slice borrows the registry, so it can't outlive a release
        unsafe {
            let len = header.as_ref().payload_len();
            Some(slice::from_raw_parts(handle.as_ptr(), len))
        }
    }

    fn payload_mut(&mut self, handle: Handle) -> Option<&mut [u8]> {
        let header = self.header(handle)?;
        // SAFETY: as in `payload()`, and the registry is borrowed mutably
        unsafe {
            let len = header.as_ref().payload_len();
            Some(slice::from_raw_parts_mut(handle.as_ptr(), len))
        }
    }

    fn link(&mut self, raw: NonNull<u8>, total: usize) -> Handle {
        let header = raw.cast::<BlockHeader>();
        // SAFETY:
        //   - `raw` is a fresh allocation of at least HEADER_SIZE bytes,
        //     aligned for `BlockHeader` by `malloc()`
        //   - `self.head`, when non-null, is a live header we own
        unsafe {
            header.as_ptr().write(BlockHeader {
                next: self.head,
                prev: ptr::null_mut(),
                signature: SIGNATURE,
                size: total,
            });
            if !self.head.is_null() {
                (*self.head).prev = header.as_ptr();
            }
        }
        self.head = header.as_ptr();

        let handle = BlockHeader::payload(header);
        self.live.insert(handle.addr());
        self.blocks += 1;
        self.bytes += total;
        handle
    }

    /// Unlink and free `handle`. Returns the block's total size, or `None`
    /// if it isn't ours.
    fn unlink(&mut self, handle: Handle) -> Option<usize> {
        let header = self.header(handle)?;
        // SAFETY: the header and its neighbours are live blocks we own; the
        //         header is not touched again after `free()`
        let size = unsafe {
            let BlockHeader {
                next, prev, size, ..
            } = *header.as_ptr();
            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            manual::free(header.cast());
            size
        };
        self.live.remove(&handle.addr());
        self.blocks -= 1;
        self.bytes -= size;
        Some(size)
    }
}

/// Tracked allocator. Every block it hands out stays on its tracking list
/// until it is released, either on its own or by [`TrackingAlloc::release_all()`].
///
/// All operations take `&self`; the registry sits in a `RefCell`, so this
/// type is single-threaded (`!Sync`). Holding a payload borrow from
/// [`TrackingAlloc::bytes()`] or [`TrackingAlloc::bytes_mut()`] across an
/// allocation or release panics.
///
/// Dropping the allocator releases everything that is still live.
pub struct TrackingAlloc {
    config: TrackingConfig,
    registry: RefCell<Registry>,
}

impl Default for TrackingAlloc {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingAlloc {
    pub fn new() -> Self {
        Self::with_config(TrackingConfig::default())
    }

    pub fn with_config(config: TrackingConfig) -> Self {
        Self {
            config,
            registry: RefCell::new(Registry::new()),
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Allocate `size` zeroed payload bytes. The block is `size +
    /// HEADER_SIZE` bytes long and is linked at the head of the tracking
    /// list.
    pub fn allocate(&self, size: usize) -> Result<Handle, AllocError> {
        let total = size
            .checked_add(HEADER_SIZE)
            .ok_or(AllocError::Overflow { requested: size })?;
        let mut registry = self.registry.borrow_mut();

        if let Some(limit) = self.config.byte_limit {
            if registry.bytes.saturating_add(total) > limit {
                return cold(|| {
                    warn!(
                        "allocate({size}) refused: {} of {limit} bytes outstanding",
                        registry.bytes
                    );
                    Err(AllocError::Exhausted { requested: size })
                });
            }
        }

        let raw = manual::malloc(total).map_err(|_| AllocError::Exhausted { requested: size })?;
        let handle = registry.link(raw, total);
        trace!(
            "allocate({size}) -> {handle:?}, {} blocks / {} bytes outstanding",
            registry.blocks,
            registry.bytes
        );
        Ok(handle)
    }

    /// Release a single block.
    ///
    /// A pointer that is not a live block of this allocator (foreign, stack,
    /// already released, corrupted header) is refused and left alone: it is
    /// better to leak it than to free something we don't own.
    pub fn release(&self, ptr: Option<Handle>) -> Released {
        let Some(handle) = ptr else {
            return Released::Null;
        };
        let mut registry = self.registry.borrow_mut();
        match registry.unlink(handle) {
            Some(size) => {
                trace!("release({handle:?}) freed {size} bytes");
                Released::Freed
            }
            None => cold(|| {
                warn!("release({handle:?}): unregistered object, not freeing it");
                Released::Unregistered(handle)
            }),
        }
    }

    /// Release every live block, first linked to last, and zero the
    /// outstanding totals. Nothing happens if nothing is live.
    pub fn release_all(&self) {
        let mut registry = self.registry.borrow_mut();
        if registry.head.is_null() {
            return;
        }
        let (blocks, bytes) = (registry.blocks, registry.bytes);

        let mut current = registry.head;
        while let Some(header) = NonNull::new(current) {
            // SAFETY: every header reachable from `head` is live
            current = unsafe { (*header.as_ptr()).next };
            if registry.unlink(BlockHeader::payload(header)).is_none() {
                warn!("release_all(): leaking corrupted block at {header:p}");
            }
        }

        registry.head = ptr::null_mut();
        registry.live.clear();
        registry.blocks = 0;
        registry.bytes = 0;
        registry.epoch += 1;
        debug!("release_all() released {blocks} blocks ({bytes} bytes)");
    }

    /// Copy `text` into a new block, followed by a NUL terminator.
    pub fn copy_string(&self, text: &str) -> Result<Handle, AllocError> {
        let len = text.len();
        let handle = self.allocate(
            len.checked_add(1)
                .ok_or(AllocError::Overflow { requested: len })?,
        )?;
        let mut payload = self.expect_payload_mut(handle)?;
        payload[..len].copy_from_slice(text.as_bytes());
        payload[len] = 0;
        Ok(handle)
    }

    /// Copy a plain value into a new block of exactly `size_of::<T>()`
    /// bytes.
    pub fn copy_scalar<T: Pod>(&self, value: T) -> Result<Handle, AllocError> {
        let handle = self.allocate(mem::size_of::<T>())?;
        self.expect_payload_mut(handle)?
            .copy_from_slice(bytemuck::bytes_of(&value));
        Ok(handle)
    }

    /// Read back a string written by [`TrackingAlloc::copy_string()`], up to
    /// its terminator.
    pub fn read_str(&self, handle: Handle) -> Option<String> {
        let payload = self.bytes(handle)?;
        let end = payload.iter().position(|b| *b == 0)?;
        String::from_utf8(payload[..end].to_vec()).ok()
    }

    /// Read back a value written by [`TrackingAlloc::copy_scalar()`]. `None`
    /// if the block is not live or is not `size_of::<T>()` bytes long.
    pub fn read_scalar<T: Pod>(&self, handle: Handle) -> Option<T> {
        let payload = self.bytes(handle)?;
        (payload.len() == mem::size_of::<T>()).then(|| bytemuck::pod_read_unaligned(&payload))
    }

    /// Borrow the payload of a live block.
    pub fn bytes(&self, handle: Handle) -> Option<Ref<'_, [u8]>> {
        Ref::filter_map(self.registry.borrow(), |registry| registry.payload(handle)).ok()
    }

    pub fn bytes_mut(&self, handle: Handle) -> Option<RefMut<'_, [u8]>> {
        RefMut::filter_map(self.registry.borrow_mut(), |registry| {
            registry.payload_mut(handle)
        })
        .ok()
    }

    fn expect_payload_mut(&self, handle: Handle) -> Result<RefMut<'_, [u8]>, AllocError> {
        self.bytes_mut(handle).ok_or(AllocError::Unregistered {
            address: handle.addr(),
        })
    }

    /// Copy the first `len` payload bytes of `src` into `dst`. Both must be
    /// distinct live blocks with at least `len` payload bytes.
    pub(crate) fn copy_payload(
        &self,
        src: Handle,
        dst: Handle,
        len: usize,
    ) -> Result<(), AllocError> {
        let registry = self.registry.borrow();
        let src_len = registry
            .payload(src)
            .ok_or(AllocError::Unregistered { address: src.addr() })?
            .len();
        let dst_len = registry
            .payload(dst)
            .ok_or(AllocError::Unregistered { address: dst.addr() })?
            .len();
        debug_assert!(src != dst);
        debug_assert!(len <= src_len && len <= dst_len);
        // SAFETY:
        //   - both blocks are live and at least `len` bytes long
        //   - distinct blocks never overlap
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), len.min(src_len).min(dst_len));
        }
        Ok(())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.registry.borrow().header(handle).is_some()
    }

    pub fn stats(&self) -> AllocStats {
        let registry = self.registry.borrow();
        AllocStats {
            blocks: registry.blocks,
            bytes: registry.bytes,
        }
    }

    /// Number of bulk clears that released at least one block.
    pub fn epoch(&self) -> u64 {
        self.registry.borrow().epoch
    }

    /// Every live block, most recently allocated first.
    pub fn snapshot(&self) -> Vec<BlockInfo> {
        let registry = self.registry.borrow();
        let mut blocks = Vec::with_capacity(registry.blocks);
        let mut current = registry.head;
        while let Some(header) = NonNull::new(current) {
            // SAFETY: every header reachable from `head` is live
            let (next, size) = unsafe { ((*header.as_ptr()).next, (*header.as_ptr()).size) };
            blocks.push(BlockInfo {
                address: BlockHeader::payload(header).as_ptr() as *const (),
                size,
            });
            current = next;
        }
        blocks
    }

    /// Dump the outstanding totals and the live blocks as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Dump {
            stats: AllocStats,
            blocks: Vec<BlockInfo>,
        }

        serde_json::to_string(&Dump {
            stats: self.stats(),
            blocks: self.snapshot(),
        })
    }
}

impl Drop for TrackingAlloc {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn allocate_links_block_and_counts_header() {
        init_logger();
        let alloc = TrackingAlloc::new();
        let handle = alloc.allocate(10).unwrap();

        assert!(alloc.contains(handle));
        assert_eq!(
            alloc.stats(),
            AllocStats {
                blocks: 1,
                bytes: HEADER_SIZE + 10
            }
        );
        assert_eq!(alloc.bytes(handle).unwrap().len(), 10);
        assert!(alloc.bytes(handle).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn release_unlinks_and_returns_null() {
        let alloc = TrackingAlloc::new();
        let a = alloc.allocate(8).unwrap();
        let b = alloc.allocate(16).unwrap();
        let c = alloc.allocate(32).unwrap();

        // middle of the list
        assert_eq!(alloc.release(Some(b)), Released::Freed);
        assert_eq!(alloc.release(Some(b)).remaining(), Some(b));
        assert_eq!(
            alloc.stats(),
            AllocStats {
                blocks: 2,
                bytes: 2 * HEADER_SIZE + 40
            }
        );
        let addresses: Vec<_> = alloc.snapshot().iter().map(|b| b.address as usize).collect();
        assert_eq!(addresses, vec![c.addr(), a.addr()]);

        // head, then tail
        assert!(alloc.release(Some(c)).is_freed());
        assert!(alloc.release(Some(a)).is_freed());
        assert_eq!(alloc.stats(), AllocStats::default());
        assert!(alloc.snapshot().is_empty());
    }

    #[test]
    fn releasing_the_result_of_a_release_is_a_no_op() {
        let alloc = TrackingAlloc::new();
        let handle = alloc.allocate(4).unwrap();
        let released = alloc.release(Some(handle));
        assert_eq!(released.remaining(), None);
        assert_eq!(alloc.release(released.remaining()), Released::Null);
        assert_eq!(alloc.stats(), AllocStats::default());
    }

    #[test]
    fn stack_address_is_unregistered() {
        init_logger();
        let alloc = TrackingAlloc::new();
        alloc.allocate(24).unwrap();
        let before = alloc.stats();

        let mut local = [0u8; 64];
        let foreign = Handle::from_raw(local[HEADER_SIZE..].as_mut_ptr()).unwrap();
        assert_eq!(
            alloc.release(Some(foreign)),
            Released::Unregistered(foreign)
        );
        assert_eq!(alloc.stats(), before);
        assert_eq!(alloc.snapshot().len(), 1);
    }

    #[test]
    fn corrupted_signature_is_refused_and_leaked() {
        init_logger();
        let alloc = TrackingAlloc::new();
        let intact = alloc.allocate(8).unwrap();
        let corrupted = alloc.allocate(16).unwrap();
        // SAFETY: `corrupted` is live, so its header is ours to scribble on
        unsafe {
            (*BlockHeader::of(corrupted)).signature = !SIGNATURE;
        }
        let before = alloc.stats();

        assert_eq!(
            alloc.release(Some(corrupted)),
            Released::Unregistered(corrupted)
        );
        assert_eq!(alloc.stats(), before);
        assert!(!alloc.contains(corrupted));
        assert!(alloc.bytes(corrupted).is_none());
        assert!(alloc.contains(intact));

        alloc.release_all();
        assert_eq!(alloc.stats(), AllocStats::default());
        assert!(alloc.snapshot().is_empty());
        assert!(!alloc.contains(intact));
    }

    #[test]
    fn release_all_empties_everything() {
        let alloc = TrackingAlloc::new();
        let handles: Vec<_> = (0..5).map(|i| alloc.allocate(i * 3).unwrap()).collect();

        alloc.release_all();
        assert_eq!(alloc.stats(), AllocStats::default());
        assert_eq!(alloc.epoch(), 1);
        for handle in handles {
            assert!(!alloc.contains(handle));
        }

        // idempotent
        alloc.release_all();
        assert_eq!(alloc.stats(), AllocStats::default());
        assert_eq!(alloc.epoch(), 1);
    }

    #[test]
    fn release_all_on_fresh_allocator_is_a_no_op() {
        let alloc = TrackingAlloc::new();
        alloc.release_all();
        assert_eq!(alloc.stats(), AllocStats::default());
        assert_eq!(alloc.epoch(), 0);
    }

    #[test]
    fn copy_string_round_trip() {
        let alloc = TrackingAlloc::new();
        let handle = alloc.copy_string("abc").unwrap();

        assert_eq!(&*alloc.bytes(handle).unwrap(), b"abc\0");
        assert_eq!(alloc.read_str(handle).as_deref(), Some("abc"));

        let before = alloc.stats();
        assert!(alloc.release(Some(handle)).is_freed());
        let after = alloc.stats();
        assert_eq!(before.bytes - after.bytes, HEADER_SIZE + 4);
        assert_eq!(before.blocks - after.blocks, 1);
    }

    #[test]
    fn copy_scalar_round_trip() {
        let alloc = TrackingAlloc::new();
        let handle = alloc.copy_scalar(-42i32).unwrap();

        assert_eq!(alloc.bytes(handle).unwrap().len(), 4);
        assert_eq!(alloc.read_scalar::<i32>(handle), Some(-42));
        assert_eq!(alloc.read_scalar::<u64>(handle), None);
    }

    #[test]
    fn byte_limit_reports_exhaustion_without_linking() {
        let alloc = TrackingAlloc::with_config(TrackingConfig {
            byte_limit: Some(2 * HEADER_SIZE + 8),
        });
        alloc.allocate(4).unwrap();
        alloc.allocate(4).unwrap();
        let before = alloc.stats();

        assert_eq!(
            alloc.allocate(1),
            Err(AllocError::Exhausted { requested: 1 })
        );
        assert_eq!(
            alloc.copy_string("x"),
            Err(AllocError::Exhausted { requested: 2 })
        );
        assert_eq!(alloc.stats(), before);
    }

    #[test]
    fn oversized_request_overflows() {
        let alloc = TrackingAlloc::new();
        assert_eq!(
            alloc.allocate(usize::MAX),
            Err(AllocError::Overflow {
                requested: usize::MAX
            })
        );
    }

    #[test]
    fn config_from_env() {
        env::remove_var(BYTE_LIMIT_VAR);
        assert_eq!(TrackingConfig::from_env(), Ok(TrackingConfig::default()));

        env::set_var(BYTE_LIMIT_VAR, "4096");
        assert_eq!(
            TrackingConfig::from_env(),
            Ok(TrackingConfig {
                byte_limit: Some(4096)
            })
        );

        env::set_var(BYTE_LIMIT_VAR, "lots");
        assert_eq!(
            TrackingConfig::from_env(),
            Err(ConfigError::InvalidByteLimit {
                value: "lots".to_string()
            })
        );
        env::remove_var(BYTE_LIMIT_VAR);
    }

    #[test]
    fn json_dump_lists_live_blocks() {
        let alloc = TrackingAlloc::new();
        let handle = alloc.allocate(3).unwrap();
        let dump: serde_json::Value = serde_json::from_str(&alloc.to_json().unwrap()).unwrap();

        assert_eq!(dump["stats"]["blocks"], 1);
        assert_eq!(dump["stats"]["bytes"], HEADER_SIZE + 3);
        assert_eq!(dump["blocks"][0]["address"], handle.addr() as u64);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(usize),
        Release(usize),
        ReleaseAll,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0usize..256).prop_map(Op::Allocate),
            3 => any::<usize>().prop_map(Op::Release),
            1 => Just(Op::ReleaseAll),
        ]
    }

    proptest! {
        #[test]
        fn totals_match_live_blocks(ops in prop::collection::vec(op(), 0..64)) {
            let alloc = TrackingAlloc::new();
            let mut live: Vec<(Handle, usize)> = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate(size) => {
                        let handle = alloc.allocate(size).unwrap();
                        live.push((handle, size + HEADER_SIZE));
                    }
                    Op::Release(index) if !live.is_empty() => {
                        let (handle, _) = live.swap_remove(index % live.len());
                        prop_assert_eq!(alloc.release(Some(handle)), Released::Freed);
                    }
                    Op::Release(_) => {}
                    Op::ReleaseAll => {
                        alloc.release_all();
                        live.clear();
                    }
                }

                let stats = alloc.stats();
                prop_assert_eq!(stats.blocks, live.len());
                prop_assert_eq!(stats.bytes, live.iter().map(|(_, size)| size).sum::<usize>());
                prop_assert_eq!(alloc.snapshot().len(), live.len());
            }

            alloc.release_all();
            prop_assert_eq!(alloc.stats(), AllocStats::default());
        }
    }
}
