//! Thin collection aliases, so the rest of the crate can swap the
//! hasher used by `HashMap`/`HashSet` behind one feature flag, the
//! way the teacher's `collections` module does
//! (`collections_randomstate_twox_hash` vs `collections_randomstate_std`).
//!
//! `OrderedMap` additionally preserves insertion order with O(1)
//! removal, used by the request manager's FIFO queue of
//! not-yet-batched requests (mirrors the teacher's `Log::requests`).

#[cfg(feature = "collections_randomstate_twox_hash")]
pub type RandomState = twox_hash::RandomXxHashBuilder64;

#[cfg(not(feature = "collections_randomstate_twox_hash"))]
pub type RandomState = std::collections::hash_map::RandomState;

pub type HashMap<K, V> = std::collections::HashMap<K, V, RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, RandomState>;

pub type OrderedMap<K, V> = linked_hash_map::LinkedHashMap<K, V>;

pub fn hash_map<K, V>() -> HashMap<K, V> {
    HashMap::default()
}

pub fn hash_map_capacity<K, V>(capacity: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(capacity, RandomState::default())
}

pub fn hash_set<K>() -> HashSet<K> {
    HashSet::default()
}

pub fn ordered_map<K: std::hash::Hash + Eq, V>() -> OrderedMap<K, V> {
    OrderedMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_map_preserves_fifo_order() {
        let mut m: OrderedMap<i32, &str> = ordered_map();
        m.insert(1, "a");
        m.insert(2, "b");
        m.insert(3, "c");
        let keys: Vec<_> = m.keys().copied().collect();
        assert_eq!(keys, vec![1, 2, 3]);
        m.pop_front();
        let keys: Vec<_> = m.keys().copied().collect();
        assert_eq!(keys, vec![2, 3]);
    }
}
