//! Fixed-capacity table of tracked memory regions.
//!
//! The table is scanned from the fault handler while a single controlling
//! thread registers and removes regions, so lookups never lock. Each slot
//! moves through `Free -> Reserved -> Live`:
//!
//! - `allocate` claims a free slot (`Free -> Reserved`); lookups skip it.
//! - `describe` writes every field, then publishes the slot with a Release
//!   store of `Live`.
//! - `lookup` reads the fields only after an Acquire load observed `Live`,
//!   so a concurrently faulting thread sees either nothing or the whole entry.
//! - `free` stores `Free`; the remaining fields become stale and are never
//!   read again until the slot is described anew.
//!
//! A reader may pass a slot while it is freed and described again for a
//! different region. Every field write is bracketed by a per-slot sequence
//! counter (odd while a write is in progress), and a copy is only accepted
//! when the counter is even and unchanged across it.
//!
//! Removing a region that may still be faulted on from another thread is the
//! caller's problem: quiesce users of the range before freeing it.

use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering, fence};

use crate::resolver::FaultResolver;

/// Maximum number of simultaneously tracked regions.
pub const MAX_TRACKED_REGIONS: usize = 32;

const SLOT_FREE: u8 = 0;
const SLOT_RESERVED: u8 = 1;
const SLOT_LIVE: u8 = 2;

/// Stable identity of a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle(usize);

impl RegionHandle {
    /// Slot index in the registry.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// A published region, copied out of its slot.
#[derive(Clone, Copy)]
pub struct TrackedRegion {
    /// Slot holding the region.
    pub handle: RegionHandle,
    /// First byte of the range.
    pub base: usize,
    /// Length in bytes; the range is `[base, base + size)`.
    pub size: usize,
    /// Token of the platform hook that was active when the region was registered.
    pub token: usize,
    /// Resolver invoked for faults inside the range.
    pub resolver: &'static dyn FaultResolver,
}

impl TrackedRegion {
    /// Whether `addr` lies inside the range.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Offset of `addr` from the region base, if it lies inside.
    #[inline]
    pub fn offset_of(&self, addr: usize) -> Option<usize> {
        self.contains(addr).then(|| addr - self.base)
    }
}

impl core::fmt::Debug for TrackedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrackedRegion")
            .field("slot", &self.handle.index())
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("token", &format_args!("{:#x}", self.token))
            .finish_non_exhaustive()
    }
}

/// Attempts at a consistent copy of a slot that is being rewritten.
const READ_RETRIES: usize = 4;

/// Resolver reference split into words so it can be stored atomically.
type ResolverBits = [usize; 2];

fn resolver_to_bits(resolver: &'static dyn FaultResolver) -> ResolverBits {
    // SAFETY: a trait object reference is two words (data, vtable).
    unsafe { core::mem::transmute::<&'static dyn FaultResolver, ResolverBits>(resolver) }
}

/// # Safety
///
/// `bits` must come from [`resolver_to_bits`], unmodified.
unsafe fn resolver_from_bits(bits: ResolverBits) -> &'static dyn FaultResolver {
    unsafe { core::mem::transmute::<ResolverBits, &'static dyn FaultResolver>(bits) }
}

struct RegionSlot {
    state: AtomicU8,
    /// Odd while `describe` or `free` is writing the slot.
    seq: AtomicUsize,
    base: AtomicUsize,
    size: AtomicUsize,
    token: AtomicUsize,
    /// `resolver_to_bits` of the resolver; all zero until first described.
    resolver: [AtomicUsize; 2],
}

impl RegionSlot {
    const fn new() -> Self {
        Self {
            state: AtomicU8::new(SLOT_FREE),
            seq: AtomicUsize::new(0),
            base: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            token: AtomicUsize::new(0),
            resolver: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Enter a write section. Writers are serialized by slot ownership.
    #[inline]
    fn begin_write(&self) -> usize {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        seq
    }

    #[inline]
    fn end_write(&self, seq: usize) {
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Copy the slot out if it is live.
    #[inline]
    fn load_live(&self, index: usize) -> Option<TrackedRegion> {
        for _ in 0..READ_RETRIES {
            let before = self.seq.load(Ordering::Acquire);
            if before & 1 != 0 {
                // Mid-write: the slot is not published yet.
                return None;
            }
            if self.state.load(Ordering::Acquire) != SLOT_LIVE {
                return None;
            }

            let base = self.base.load(Ordering::Relaxed);
            let size = self.size.load(Ordering::Relaxed);
            let token = self.token.load(Ordering::Relaxed);
            let bits = [
                self.resolver[0].load(Ordering::Relaxed),
                self.resolver[1].load(Ordering::Relaxed),
            ];

            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) != before {
                continue;
            }
            if bits == [0, 0] {
                return None;
            }

            return Some(TrackedRegion {
                handle: RegionHandle(index),
                base,
                size,
                token,
                // SAFETY: the unchanged even sequence number means all words
                // were written by one completed `describe`.
                resolver: unsafe { resolver_from_bits(bits) },
            });
        }

        None
    }
}

/// Region table shared between the registering thread and fault handlers.
pub struct RegionRegistry {
    slots: [RegionSlot; MAX_TRACKED_REGIONS],
}

impl RegionRegistry {
    /// An empty table; every slot starts free.
    pub const fn new() -> Self {
        Self {
            slots: [const { RegionSlot::new() }; MAX_TRACKED_REGIONS],
        }
    }

    /// Claim the first free slot.
    ///
    /// The slot stays invisible to [`lookup`](Self::lookup) until it is
    /// published by [`describe`](Self::describe). Returns `None` when every
    /// slot is taken.
    pub fn allocate(&self) -> Option<RegionHandle> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .state
                .compare_exchange(SLOT_FREE, SLOT_RESERVED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(RegionHandle(index));
            }
        }

        None
    }

    /// Fill in a reserved slot and make it visible to lookups.
    ///
    /// Returns false (and changes nothing) if the slot was not reserved.
    pub fn describe(
        &self,
        handle: RegionHandle,
        base: usize,
        size: usize,
        token: usize,
        resolver: &'static dyn FaultResolver,
    ) -> bool {
        let Some(slot) = self.slots.get(handle.0) else {
            return false;
        };
        if slot.state.load(Ordering::Acquire) != SLOT_RESERVED {
            return false;
        }

        let bits = resolver_to_bits(resolver);
        let seq = slot.begin_write();
        slot.base.store(base, Ordering::Relaxed);
        slot.size.store(size, Ordering::Relaxed);
        slot.token.store(token, Ordering::Relaxed);
        slot.resolver[0].store(bits[0], Ordering::Relaxed);
        slot.resolver[1].store(bits[1], Ordering::Relaxed);
        slot.end_write(seq);

        slot.state.store(SLOT_LIVE, Ordering::Release);
        true
    }

    /// Release a slot, live or reserved.
    ///
    /// Returns false if the slot was already free.
    pub fn free(&self, handle: RegionHandle) -> bool {
        match self.slots.get(handle.0) {
            Some(slot) => {
                let seq = slot.begin_write();
                let was = slot.state.swap(SLOT_FREE, Ordering::AcqRel);
                slot.end_write(seq);
                was != SLOT_FREE
            }
            None => false,
        }
    }

    /// First live region, in slot order, containing `addr`.
    ///
    /// Called from the fault handler: no allocation, no locks, no blocking.
    #[inline]
    pub fn lookup(&self, addr: usize) -> Option<TrackedRegion> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.load_live(index))
            .find(|region| region.contains(addr))
    }

    /// The region behind `handle`, if it is live.
    pub fn get(&self, handle: RegionHandle) -> Option<TrackedRegion> {
        self.slots.get(handle.0)?.load_live(handle.0)
    }

    /// Whether `handle` refers to a live region.
    pub fn is_live(&self, handle: RegionHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live regions.
    pub fn live_count(&self) -> usize {
        self.iter_live().count()
    }

    /// Live regions in slot order.
    pub fn iter_live(&self) -> impl Iterator<Item = TrackedRegion> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.load_live(index))
    }
}

impl Default for RegionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
