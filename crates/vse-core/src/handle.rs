//! Generational handles for index-based relations.
//!
//! Entities and GPU resources refer to each other through `Handle<T>` values
//! that index into an owning `HandleMap`. A handle whose slot was reused
//! carries a stale generation and resolves to `None`.
//!
//! A map may issue handles typed by a marker instead of its value type, so
//! crates that only pass ids around (the scene graph) never see the value.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Typed index plus generation into a [`HandleMap`].
pub struct Handle<T> {
    index: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    const fn new(index: u32, generation: u32) -> Self {
        Self {
            index,
            generation,
            _marker: PhantomData,
        }
    }

    /// Slot index.
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when this handle was issued.
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into a single integer, stable for the lifetime of the handle.
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_bits().cmp(&other.to_bits())
    }
}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_bits().hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

/// Marker for mesh handles.
pub enum Mesh {}
/// Marker for material handles.
pub enum Material {}
/// Marker for texture handles.
pub enum Texture {}

pub type MeshId = Handle<Mesh>;
pub type MaterialId = Handle<Material>;
pub type TextureId = Handle<Texture>;

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot map with generation-checked handles typed by `M`.
pub struct HandleMap<T, M = T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    _marker: PhantomData<fn() -> M>,
}

impl<T, M> Default for HandleMap<T, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, M> HandleMap<T, M> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            _marker: PhantomData,
        }
    }

    pub fn insert(&mut self, value: T) -> Handle<M> {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return Handle::new(index, slot.generation);
        }

        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        assert!(index != u32::MAX, "handle map exhausted");
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Handle::new(index, 0)
    }

    pub fn get(&self, handle: Handle<M>) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle<M>) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn contains(&self, handle: Handle<M>) -> bool {
        self.get(handle).is_some()
    }

    /// Remove the value; the slot's generation is bumped so old handles go stale.
    pub fn remove(&mut self, handle: Handle<M>) -> Option<T> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)?;
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<M>, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (Handle::new(index as u32, slot.generation), value))
        })
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.value.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut map: HandleMap<&str> = HandleMap::new();
        let a = map.insert("a");
        assert_eq!(map.remove(a), Some("a"));

        let b = map.insert("b");
        assert_eq!(a.index(), b.index());
        assert_ne!(a, b);
        assert!(map.get(a).is_none());
        assert_eq!(map.get(b), Some(&"b"));
        assert!(map.remove(a).is_none());
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn iter_skips_holes() {
        let mut map: HandleMap<i32> = HandleMap::new();
        let handles: Vec<_> = (0..4).map(|i| map.insert(i)).collect();
        map.remove(handles[1]);
        let values: Vec<_> = map.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 2, 3]);
    }

    #[test]
    fn marker_typed_handles() {
        let mut map: HandleMap<String, Mesh> = HandleMap::new();
        let id: MeshId = map.insert("cube".to_string());
        assert_eq!(map.get(id).map(String::as_str), Some("cube"));
        assert_eq!(id.to_bits(), u64::from(id.index()));
    }
}
