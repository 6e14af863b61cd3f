//! GPU memory management.
//!
//! Allocations are sub-ranges of backing regions grouped into arenas, one pool
//! of arenas per [`UsageClass`]. Arenas grow by doubling up to a per-class
//! ceiling and are never relocated. A separate ring pool serves transient
//! staging memory that is reclaimed in bulk once its [`TransientTag`] retires.

use crate::device::GpuDevice;
use crate::error::{GpuError, Result};
use crate::types::{BufferSlice, RegionDesc, RegionId};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

/// What a backing region is used for; selects buffer usage and memory location.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UsageClass {
    Vertex,
    Index,
    Uniform,
    Staging,
    Image,
}

impl UsageClass {
    pub const ALL: [Self; 5] = [
        Self::Vertex,
        Self::Index,
        Self::Uniform,
        Self::Staging,
        Self::Image,
    ];

    /// Whether the CPU can write regions of this class directly.
    pub const fn host_visible(self) -> bool {
        matches!(self, Self::Uniform | Self::Staging)
    }

    const fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    /// Long-lived sub-allocations freed individually.
    Stable,
    /// Transient space reclaimed when its tag retires.
    Ring,
}

/// Identifies a batch of ring allocations retired together.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransientTag(u64);

/// A sub-range of a backing region.
///
/// Not `Clone`: exactly one resource owns each allocation.
#[derive(Debug, PartialEq, Eq)]
pub struct Allocation {
    class: UsageClass,
    pool: PoolKind,
    arena: u32,
    region: RegionId,
    offset: u64,
    size: u64,
    serial: u64,
}

impl Allocation {
    pub const fn class(&self) -> UsageClass {
        self.class
    }

    pub const fn pool(&self) -> PoolKind {
        self.pool
    }

    /// Index of the owning arena within its class pool.
    pub const fn arena(&self) -> u32 {
        self.arena
    }

    pub const fn region(&self) -> RegionId {
        self.region
    }

    pub const fn offset(&self) -> u64 {
        self.offset
    }

    pub const fn size(&self) -> u64 {
        self.size
    }

    pub const fn slice(&self) -> BufferSlice {
        BufferSlice {
            region: self.region,
            offset: self.offset,
            size: self.size,
        }
    }

    /// Byte range `[start, end)` inside the region.
    pub const fn range(&self) -> (u64, u64) {
        (self.offset, self.offset + self.size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLimits {
    /// Size of the first arena.
    pub initial_arena_size: u64,
    /// Upper bound on the bytes reserved by all arenas of the class.
    pub ceiling: u64,
}

impl ClassLimits {
    pub const fn new(initial_arena_size: u64, ceiling: u64) -> Self {
        Self {
            initial_arena_size,
            ceiling,
        }
    }
}

/// Allocator configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    pub vertex: ClassLimits,
    pub index: ClassLimits,
    pub uniform: ClassLimits,
    pub staging: ClassLimits,
    pub image: ClassLimits,
    /// Size of the transient ring; zero disables it.
    pub ring_size: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            vertex: ClassLimits::new(16 * MIB, 1024 * MIB),
            index: ClassLimits::new(8 * MIB, 512 * MIB),
            uniform: ClassLimits::new(MIB, 64 * MIB),
            staging: ClassLimits::new(16 * MIB, 512 * MIB),
            image: ClassLimits::new(64 * MIB, 2048 * MIB),
            ring_size: 32 * MIB,
        }
    }
}

impl AllocatorConfig {
    pub const fn limits(&self, class: UsageClass) -> ClassLimits {
        match class {
            UsageClass::Vertex => self.vertex,
            UsageClass::Index => self.index,
            UsageClass::Uniform => self.uniform,
            UsageClass::Staging => self.staging,
            UsageClass::Image => self.image,
        }
    }

    /// Set the same limits for every class.
    #[must_use]
    pub const fn with_uniform_limits(mut self, limits: ClassLimits) -> Self {
        self.vertex = limits;
        self.index = limits;
        self.uniform = limits;
        self.staging = limits;
        self.image = limits;
        self
    }

    #[must_use]
    pub const fn with_class_limits(mut self, class: UsageClass, limits: ClassLimits) -> Self {
        match class {
            UsageClass::Vertex => self.vertex = limits,
            UsageClass::Index => self.index = limits,
            UsageClass::Uniform => self.uniform = limits,
            UsageClass::Staging => self.staging = limits,
            UsageClass::Image => self.image = limits,
        }
        self
    }

    #[must_use]
    pub const fn with_ring_size(mut self, ring_size: u64) -> Self {
        self.ring_size = ring_size;
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub arenas: usize,
    /// Bytes reserved by backing regions.
    pub reserved: u64,
    /// Bytes handed out to live allocations.
    pub allocated: u64,
    pub live_allocations: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    classes: [ClassStats; 5],
    pub ring_capacity: u64,
    pub ring_in_use: u64,
    pub ring_spans: usize,
}

impl AllocatorStats {
    pub const fn class(&self, class: UsageClass) -> ClassStats {
        self.classes[class.slot()]
    }
}

const fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// One backing region with an offset-ordered free list.
struct Arena {
    region: RegionId,
    size: u64,
    free: BTreeMap<u64, u64>,
    live: HashMap<u64, (u64, u64)>,
}

impl Arena {
    fn new(region: RegionId, size: u64) -> Self {
        let mut free = BTreeMap::new();
        free.insert(0, size);
        Self {
            region,
            size,
            free,
            live: HashMap::new(),
        }
    }

    /// First-fit search honouring alignment.
    fn allocate(&mut self, size: u64, alignment: u64, serial: u64) -> Option<u64> {
        let (block_offset, block_size, aligned) =
            self.free.iter().find_map(|(&offset, &len)| {
                let aligned = align_up(offset, alignment);
                let end = aligned.checked_add(size)?;
                (end <= offset + len).then_some((offset, len, aligned))
            })?;

        self.free.remove(&block_offset);
        if aligned > block_offset {
            self.free.insert(block_offset, aligned - block_offset);
        }
        let tail = block_offset + block_size - (aligned + size);
        if tail > 0 {
            self.free.insert(aligned + size, tail);
        }
        self.live.insert(aligned, (size, serial));
        Some(aligned)
    }

    fn free(&mut self, offset: u64, size: u64, serial: u64) {
        match self.live.get(&offset) {
            Some(&(live_size, live_serial)) if live_size == size && live_serial == serial => {
                self.live.remove(&offset);
            }
            _ => panic!(
                "free of an allocation that is not live (offset {offset}, size {size}); double free?"
            ),
        }

        let mut start = offset;
        let mut len = size;

        // Coalesce with the preceding block
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }

        // Coalesce with the following block
        if let Some(next_len) = self.free.remove(&(offset + size)) {
            len += next_len;
        }

        self.free.insert(start, len);
    }

    fn allocated(&self) -> u64 {
        self.live.values().map(|&(size, _)| size).sum()
    }
}

#[derive(Default)]
struct ClassPool {
    arenas: Vec<Arena>,
    reserved: u64,
    next_arena_size: u64,
}

struct RingSpan {
    offset: u64,
    size: u64,
    tag: TransientTag,
}

/// Ring of transient staging memory reclaimed front to back.
struct RingPool {
    region: Option<RegionId>,
    capacity: u64,
    spans: VecDeque<RingSpan>,
    outstanding: HashMap<TransientTag, usize>,
    retired: HashSet<TransientTag>,
}

impl RingPool {
    fn new(capacity: u64) -> Self {
        Self {
            region: None,
            capacity,
            spans: VecDeque::new(),
            outstanding: HashMap::new(),
            retired: HashSet::new(),
        }
    }

    /// Free space is `[head, cap) + [0, front)` when the ring has not wrapped,
    /// and `[head, front)` once it has.
    fn place(&self, size: u64, alignment: u64) -> Option<u64> {
        if size > self.capacity {
            return None;
        }
        let (Some(front), Some(back)) = (self.spans.front(), self.spans.back()) else {
            return Some(0);
        };

        let head = align_up(back.offset + back.size, alignment);
        if back.offset >= front.offset {
            if head + size <= self.capacity {
                Some(head)
            } else if size <= front.offset {
                Some(0)
            } else {
                None
            }
        } else if head + size <= front.offset {
            Some(head)
        } else {
            None
        }
    }

    fn push(&mut self, offset: u64, size: u64, tag: TransientTag) {
        self.spans.push_back(RingSpan { offset, size, tag });
        *self.outstanding.entry(tag).or_insert(0) += 1;
    }

    fn retire(&mut self, tag: TransientTag) {
        if self.outstanding.contains_key(&tag) {
            self.retired.insert(tag);
        }
        self.reclaim();
    }

    fn reclaim(&mut self) {
        while let Some(front) = self.spans.front() {
            let tag = front.tag;
            if !self.retired.contains(&tag) {
                break;
            }
            self.spans.pop_front();
            if let Some(count) = self.outstanding.get_mut(&tag) {
                *count -= 1;
                if *count == 0 {
                    self.outstanding.remove(&tag);
                    self.retired.remove(&tag);
                }
            }
        }
    }

    fn in_use(&self) -> u64 {
        self.spans.iter().map(|s| s.size).sum()
    }
}

struct AllocatorInner {
    pools: [ClassPool; 5],
    ring: RingPool,
    next_serial: u64,
    next_tag: u64,
    shut_down: bool,
}

/// Thread-safe sub-allocator over backend memory regions.
pub struct Allocator {
    device: Arc<dyn GpuDevice>,
    config: AllocatorConfig,
    inner: Mutex<AllocatorInner>,
}

impl Allocator {
    pub fn new(device: Arc<dyn GpuDevice>, config: AllocatorConfig) -> Self {
        let pools = UsageClass::ALL.map(|class| ClassPool {
            next_arena_size: config.limits(class).initial_arena_size.max(1),
            ..Default::default()
        });
        let ring = RingPool::new(config.ring_size);
        Self {
            device,
            config,
            inner: Mutex::new(AllocatorInner {
                pools,
                ring,
                next_serial: 1,
                next_tag: 1,
                shut_down: false,
            }),
        }
    }

    pub const fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Sub-allocate `size` bytes from a stable arena of `class`.
    pub fn allocate(&self, size: u64, alignment: u64, class: UsageClass) -> Result<Allocation> {
        if size == 0 {
            return Err(GpuError::InvalidState("zero-sized allocation".to_string()));
        }
        let alignment = alignment.max(1);
        let limits = self.config.limits(class);

        let mut inner = self.inner.lock();
        if inner.shut_down {
            return Err(GpuError::InvalidState("allocator shut down".to_string()));
        }
        let serial = inner.next_serial;
        inner.next_serial += 1;

        let pool = &mut inner.pools[class.slot()];
        for (index, arena) in pool.arenas.iter_mut().enumerate() {
            if let Some(offset) = arena.allocate(size, alignment, serial) {
                return Ok(Allocation {
                    class,
                    pool: PoolKind::Stable,
                    arena: index as u32,
                    region: arena.region,
                    offset,
                    size,
                    serial,
                });
            }
        }

        // Grow: double the previous arena until the request fits, clamped to the ceiling.
        let out_of_memory = GpuError::OutOfMemory {
            class,
            requested: size,
            ceiling: limits.ceiling,
        };
        let Some(worst_case) = size.checked_add(alignment - 1) else {
            return Err(out_of_memory);
        };
        let mut arena_size = pool.next_arena_size;
        while arena_size < worst_case {
            arena_size = arena_size.saturating_mul(2);
        }
        let headroom = limits.ceiling.saturating_sub(pool.reserved);
        let arena_size = arena_size.min(headroom);
        if arena_size < size {
            return Err(out_of_memory);
        }

        let region = match self.device.create_region(&RegionDesc {
            class,
            size: arena_size,
        }) {
            Ok(region) => region,
            Err(GpuError::OutOfDeviceMemory) => return Err(out_of_memory),
            Err(e) => return Err(e),
        };

        let mut arena = Arena::new(region, arena_size);
        let Some(offset) = arena.allocate(size, alignment, serial) else {
            // Clamped arena too small once alignment is applied; keep it for later requests.
            pool.reserved += arena_size;
            pool.arenas.push(arena);
            return Err(out_of_memory);
        };

        tracing::debug!(
            "New {:?} arena #{} of {} bytes ({} reserved)",
            class,
            pool.arenas.len(),
            arena_size,
            pool.reserved + arena_size
        );

        let index = pool.arenas.len() as u32;
        pool.reserved += arena_size;
        pool.next_arena_size = arena_size.saturating_mul(2);
        pool.arenas.push(arena);

        Ok(Allocation {
            class,
            pool: PoolKind::Stable,
            arena: index,
            region,
            offset,
            size,
            serial,
        })
    }

    /// Return a stable allocation to its arena. Ring allocations are reclaimed by tag.
    ///
    /// # Panics
    /// Panics if the allocation is not live in this allocator.
    pub fn free(&self, allocation: Allocation) {
        if allocation.pool == PoolKind::Ring {
            return;
        }
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        let arena = inner.pools[allocation.class.slot()]
            .arenas
            .get_mut(allocation.arena as usize)
            .filter(|arena| arena.region == allocation.region)
            .unwrap_or_else(|| panic!("free of allocation from unknown arena {}", allocation.arena));
        arena.free(allocation.offset, allocation.size, allocation.serial);
    }

    /// Start a new batch of ring allocations.
    pub fn begin_transient(&self) -> TransientTag {
        let mut inner = self.inner.lock();
        let tag = TransientTag(inner.next_tag);
        inner.next_tag += 1;
        tag
    }

    /// Allocate staging memory from the ring. Fails with `OutOfMemory` when the ring is full.
    pub fn allocate_transient(
        &self,
        size: u64,
        alignment: u64,
        tag: TransientTag,
    ) -> Result<Allocation> {
        if size == 0 {
            return Err(GpuError::InvalidState("zero-sized allocation".to_string()));
        }
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return Err(GpuError::InvalidState("allocator shut down".to_string()));
        }

        let out_of_memory = GpuError::OutOfMemory {
            class: UsageClass::Staging,
            requested: size,
            ceiling: self.config.ring_size,
        };
        let Some(offset) = inner.ring.place(size, alignment.max(1)) else {
            return Err(out_of_memory);
        };

        let region = match inner.ring.region {
            Some(region) => region,
            None => {
                let region = self
                    .device
                    .create_region(&RegionDesc {
                        class: UsageClass::Staging,
                        size: self.config.ring_size,
                    })
                    .map_err(|e| match e {
                        GpuError::OutOfDeviceMemory => out_of_memory,
                        other => other,
                    })?;
                inner.ring.region = Some(region);
                region
            }
        };

        inner.ring.push(offset, size, tag);
        let serial = inner.next_serial;
        inner.next_serial += 1;

        Ok(Allocation {
            class: UsageClass::Staging,
            pool: PoolKind::Ring,
            arena: u32::MAX,
            region,
            offset,
            size,
            serial,
        })
    }

    /// Reclaim ring space of `tag` once no older live span precedes it.
    pub fn retire_transient(&self, tag: TransientTag) {
        self.inner.lock().ring.retire(tag);
    }

    /// Write bytes into a host-visible allocation.
    pub fn write(&self, allocation: &Allocation, offset: u64, data: &[u8]) -> Result<()> {
        if !allocation.class.host_visible() {
            return Err(GpuError::InvalidState(format!(
                "{:?} memory is not host visible",
                allocation.class
            )));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > allocation.size {
            return Err(GpuError::InvalidState(
                "Data range too large for allocation".to_string(),
            ));
        }
        self.device
            .write_region(allocation.region, allocation.offset + offset, data)
    }

    pub fn stats(&self) -> AllocatorStats {
        let inner = self.inner.lock();
        let mut stats = AllocatorStats {
            ring_capacity: if inner.ring.region.is_some() {
                inner.ring.capacity
            } else {
                0
            },
            ring_in_use: inner.ring.in_use(),
            ring_spans: inner.ring.spans.len(),
            ..Default::default()
        };
        for class in UsageClass::ALL {
            let pool = &inner.pools[class.slot()];
            stats.classes[class.slot()] = ClassStats {
                arenas: pool.arenas.len(),
                reserved: pool.reserved,
                allocated: pool.arenas.iter().map(Arena::allocated).sum(),
                live_allocations: pool.arenas.iter().map(|a| a.live.len()).sum(),
            };
        }
        stats
    }

    /// Destroy every backing region. Must run after the device is idle.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            return;
        }
        inner.shut_down = true;

        let mut leaked = 0usize;
        for pool in &mut inner.pools {
            for arena in pool.arenas.drain(..) {
                leaked += arena.live.len();
                debug_assert!(arena.size > 0);
                self.device.destroy_region(arena.region);
            }
            pool.reserved = 0;
        }
        if let Some(region) = inner.ring.region.take() {
            self.device.destroy_region(region);
        }
        if leaked > 0 {
            tracing::warn!("Allocator shut down with {leaked} live allocations");
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}
