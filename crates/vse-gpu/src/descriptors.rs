//! Descriptor set cache.
//!
//! Sets are keyed by their layout and the identities of the bound resources.
//! Transient sets not used for `lifetime_frames` frames are evicted; persistent
//! sets live until released. Evicted and released sets are freed once the last
//! frame that may bind them has completed.

use crate::deferred::RetirementQueue;
use crate::device::{DescriptorWrite, GpuDevice};
use crate::error::Result;
use crate::types::{DescriptorSetId, SetLayoutId};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Unused frames before a transient set is evicted.
pub const DEFAULT_DESCRIPTOR_LIFETIME: u64 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub layout: SetLayoutId,
    /// Sorted by binding.
    pub writes: Vec<DescriptorWrite>,
}

impl DescriptorKey {
    pub fn new(layout: SetLayoutId, mut writes: Vec<DescriptorWrite>) -> Self {
        writes.sort_by_key(|w| w.binding);
        Self { layout, writes }
    }
}

struct Entry {
    set: DescriptorSetId,
    persistent: bool,
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<DescriptorKey, Entry>,
    retired: RetirementQueue<DescriptorSetId>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorStats {
    pub live: usize,
    pub persistent: usize,
    pub pending_free: usize,
}

pub struct DescriptorCache {
    device: Arc<dyn GpuDevice>,
    lifetime_frames: u64,
    inner: Mutex<Inner>,
}

impl DescriptorCache {
    pub fn new(device: Arc<dyn GpuDevice>, lifetime_frames: u64) -> Self {
        Self {
            device,
            lifetime_frames: lifetime_frames.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub const fn lifetime_frames(&self) -> u64 {
        self.lifetime_frames
    }

    /// Find or allocate the set for `key`, marking it used by `generation`.
    pub fn get_or_create(
        &self,
        key: &DescriptorKey,
        persistent: bool,
        generation: u64,
    ) -> Result<DescriptorSetId> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.last_used = entry.last_used.max(generation);
            entry.persistent |= persistent;
            return Ok(entry.set);
        }

        let set = self.device.allocate_descriptor_set(key.layout)?;
        if let Err(e) = self.device.update_descriptor_set(set, &key.writes) {
            self.device.free_descriptor_set(set);
            return Err(e);
        }
        inner.entries.insert(
            key.clone(),
            Entry {
                set,
                persistent,
                last_used: generation,
            },
        );
        Ok(set)
    }

    /// Drop the set for `key`; it is freed once `generation` completes.
    pub fn release(&self, key: &DescriptorKey, generation: u64) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(key) {
            let generation = generation.max(entry.last_used);
            inner.retired.retire(entry.set, generation);
        }
    }

    /// Evict transient sets unused for the configured number of frames.
    pub fn evict_unused(&self, current_generation: u64) -> usize {
        let lifetime = self.lifetime_frames;
        let mut inner = self.inner.lock();
        let stale: Vec<DescriptorKey> = inner
            .entries
            .iter()
            .filter(|(_, e)| !e.persistent && e.last_used + lifetime < current_generation)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(entry) = inner.entries.remove(key) {
                inner.retired.retire(entry.set, entry.last_used);
            }
        }
        if !stale.is_empty() {
            tracing::trace!("Evicted {} descriptor sets", stale.len());
        }
        stale.len()
    }

    /// Free retired sets whose last frame has completed.
    pub fn collect(&self, completed_generation: u64) {
        let ready = self.inner.lock().retired.drain_completed(completed_generation);
        for set in ready {
            self.device.free_descriptor_set(set);
        }
    }

    pub fn stats(&self) -> DescriptorStats {
        let inner = self.inner.lock();
        DescriptorStats {
            live: inner.entries.len(),
            persistent: inner.entries.values().filter(|e| e.persistent).count(),
            pending_free: inner.retired.pending_count(),
        }
    }

    /// Free every set. The device must be idle.
    pub fn destroy_all(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let sets: Vec<DescriptorSetId> = inner
            .entries
            .drain()
            .map(|(_, e)| e.set)
            .chain(inner.retired.flush())
            .collect();
        drop(guard);
        for set in sets {
            self.device.free_descriptor_set(set);
        }
    }
}

impl Drop for DescriptorCache {
    fn drop(&mut self) {
        self.destroy_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DescriptorResource;
    use crate::headless::HeadlessDevice;
    use crate::shader::{BindingKind, DescriptorBinding, SetLayoutDesc, ShaderStages};
    use crate::types::{BufferSlice, RegionId};

    fn layout(device: &HeadlessDevice) -> SetLayoutId {
        device
            .create_set_layout(&SetLayoutDesc {
                bindings: vec![DescriptorBinding {
                    set: 0,
                    binding: 0,
                    kind: BindingKind::UniformBuffer,
                    count: 1,
                    stages: ShaderStages::VERTEX,
                }],
            })
            .unwrap()
    }

    fn key(layout: SetLayoutId, offset: u64) -> DescriptorKey {
        DescriptorKey::new(
            layout,
            vec![DescriptorWrite {
                binding: 0,
                resource: DescriptorResource::UniformBuffer(BufferSlice {
                    region: RegionId(1),
                    offset,
                    size: 64,
                }),
            }],
        )
    }

    #[test]
    fn equal_keys_share_a_set() {
        let device = HeadlessDevice::new_default();
        let cache = DescriptorCache::new(device.clone(), 4);
        let layout = layout(&device);

        let a = cache.get_or_create(&key(layout, 0), false, 1).unwrap();
        let b = cache.get_or_create(&key(layout, 0), false, 2).unwrap();
        let c = cache.get_or_create(&key(layout, 256), false, 2).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(device.live_descriptor_sets(), 2);
    }

    #[test]
    fn unused_sets_are_evicted_then_freed_after_completion() {
        let device = HeadlessDevice::new_default();
        let cache = DescriptorCache::new(device.clone(), 2);
        let layout = layout(&device);

        cache.get_or_create(&key(layout, 0), false, 1).unwrap();
        cache.get_or_create(&key(layout, 256), true, 1).unwrap();

        assert_eq!(cache.evict_unused(3), 0);
        assert_eq!(cache.evict_unused(4), 1);
        assert_eq!(cache.stats().pending_free, 1);
        assert_eq!(device.live_descriptor_sets(), 2);

        cache.collect(0);
        assert_eq!(device.live_descriptor_sets(), 2);
        cache.collect(1);
        assert_eq!(device.live_descriptor_sets(), 1);
        assert_eq!(
            cache.stats(),
            DescriptorStats {
                live: 1,
                persistent: 1,
                pending_free: 0
            }
        );
    }

    #[test]
    fn released_sets_wait_for_their_generation() {
        let device = HeadlessDevice::new_default();
        let cache = DescriptorCache::new(device.clone(), 10);
        let layout = layout(&device);
        let key = key(layout, 0);

        cache.get_or_create(&key, true, 3).unwrap();
        cache.release(&key, 5);
        cache.collect(4);
        assert_eq!(device.live_descriptor_sets(), 1);
        cache.collect(5);
        assert_eq!(device.live_descriptor_sets(), 0);
    }

    #[test]
    fn destroy_all_frees_live_and_retired_sets() {
        let device = HeadlessDevice::new_default();
        let cache = DescriptorCache::new(device.clone(), 10);
        let layout = layout(&device);

        cache.get_or_create(&key(layout, 0), false, 1).unwrap();
        cache.get_or_create(&key(layout, 256), true, 1).unwrap();
        cache.release(&key(layout, 0), 7);
        assert_eq!(device.live_descriptor_sets(), 2);

        cache.destroy_all();
        assert_eq!(device.live_descriptor_sets(), 0);
        assert_eq!(cache.stats(), DescriptorStats::default());
    }
}
