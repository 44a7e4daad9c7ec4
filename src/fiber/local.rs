//! Fiber-local storage: a process-wide key registry over per-fiber,
//! word-sized slots.
//!
//! Keys are allocated once from a global registry (mirroring a thread-local
//! storage API, just keyed on fibers instead of OS threads) and may be
//! freed and reused. Per-fiber storage is grown lazily, so that a freshly
//! allocated key reads back as `0` for every fiber that hasn't set it yet
//! — including fibers that existed before the key was allocated. Each key
//! also carries the generation of its index at allocation time, so that a
//! key whose index was freed and reallocated to someone else never reads
//! back a stale value left over from the previous owner.

use std::sync::Mutex;

use once_cell::sync::Lazy;

/// A fiber-local storage key. Opaque; obtained from [`alloc`].
///
/// Carries the index's generation at the time this key was allocated, so
/// that a slot written under a since-freed-and-reused index is never read
/// back through the new key that reused it (see [`Slots::get`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    index: usize,
    generation: usize,
}

struct Registry {
    next: usize,
    freed: Vec<usize>,
    /// Current generation of every index ever handed out, grown lazily
    /// alongside `next`. Bumped each time an index is reused so that
    /// `Slots` can tell a stale slot from a live one without zeroing
    /// every fiber's storage on every `free`/`alloc`.
    generations: Vec<usize>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(|| {
    Mutex::new(Registry {
        next: 0,
        freed: Vec::new(),
        generations: Vec::new(),
    })
});

/// Allocates a new fiber-local storage key.
pub fn alloc() -> Key {
    let mut registry = REGISTRY.lock().unwrap();
    if let Some(index) = registry.freed.pop() {
        registry.generations[index] += 1;
        return Key {
            index,
            generation: registry.generations[index],
        };
    }
    let index = registry.next;
    registry.next += 1;
    registry.generations.push(0);
    Key { index, generation: 0 }
}

/// Returns a key to the registry for reuse. A fiber that still holds a
/// slot written under `key` will read `0` back once the index is
/// reallocated, since the new key's generation won't match.
pub fn free(key: Key) {
    REGISTRY.lock().unwrap().freed.push(key.index);
}

/// Per-fiber slot storage, embedded in every [`super::Fiber`].
#[derive(Debug, Default)]
pub struct Slots(Vec<Option<(usize, usize)>>);

impl Slots {
    /// Returns the value stored for `key`, or `0` if nothing was ever
    /// stored under it, or if the slot holds a value from a generation of
    /// `key.index` that has since been freed and reallocated.
    pub fn get(&self, key: Key) -> usize {
        match self.0.get(key.index) {
            Some(Some((generation, value))) if *generation == key.generation => *value,
            _ => 0,
        }
    }

    pub fn set(&mut self, key: Key, value: usize) {
        if key.index >= self.0.len() {
            self.0.resize(key.index + 1, None);
        }
        self.0[key.index] = Some((key.generation, value));
    }
}

#[cfg(feature = "internal_test")]
mod tests {
    use super::*;

    #[test]
    fn fresh_key_reads_zero() {
        let key = alloc();
        let slots = Slots::default();
        assert_eq!(slots.get(key), 0);
    }

    #[test]
    fn set_then_get() {
        let key = alloc();
        let mut slots = Slots::default();
        slots.set(key, 42);
        assert_eq!(slots.get(key), 42);
    }

    #[test]
    fn freed_key_index_is_reused_with_a_new_generation() {
        let key = alloc();
        free(key);
        let key2 = alloc();
        assert_eq!(key.index, key2.index);
        assert_ne!(key, key2);
    }

    #[test]
    fn reused_key_does_not_see_prior_generations_stale_value() {
        let key = alloc();
        let mut slots = Slots::default();
        slots.set(key, 99);
        free(key);

        let key2 = alloc();
        assert_eq!(key2.index, key.index);
        assert_eq!(slots.get(key2), 0);

        slots.set(key2, 7);
        assert_eq!(slots.get(key2), 7);
        assert_eq!(slots.get(key), 0);
    }
}
