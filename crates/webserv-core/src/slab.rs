// src/slab.rs

enum Entry<T> {
    Occupied(T),
    /// Index of the next vacant slot, or `None` at the end of the free list.
    Vacant(Option<usize>),
}

/// Bounded arena with an intrusive free list.
///
/// Slots are handed out and returned in O(1). An index stays valid until the
/// value is removed, after which it may be reused by a later insert.
pub struct Slab<T> {
    entries: Vec<Entry<T>>,
    head_free: Option<usize>,
    active_count: usize,
    capacity: usize,
}

impl<T> Slab<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            head_free: None,
            active_count: 0,
            capacity,
        }
    }

    /// Store `value`, returning its index, or give it back if the slab is full.
    pub fn insert(&mut self, value: T) -> Result<usize, T> {
        if let Some(idx) = self.head_free
            && let Entry::Vacant(next) = self.entries[idx]
        {
            self.entries[idx] = Entry::Occupied(value);
            self.head_free = next;
            self.active_count += 1;
            return Ok(idx);
        }

        if self.entries.len() >= self.capacity {
            return Err(value);
        }

        self.entries.push(Entry::Occupied(value));
        self.active_count += 1;
        Ok(self.entries.len() - 1)
    }

    /// Take the value out of `index`. Removing a vacant slot is a no-op.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let slot = self.entries.get_mut(index)?;
        if matches!(slot, Entry::Vacant(_)) {
            return None;
        }

        let old = std::mem::replace(slot, Entry::Vacant(self.head_free));
        self.head_free = Some(index);
        self.active_count -= 1;
        match old {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant(_) => None,
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        match self.entries.get(index) {
            Some(Entry::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        match self.entries.get_mut(index) {
            Some(Entry::Occupied(value)) => Some(value),
            _ => None,
        }
    }

    /// Indices of all live values, in slot order.
    pub fn keys(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| matches!(e, Entry::Occupied(_)).then_some(i))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active_count
    }

    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
