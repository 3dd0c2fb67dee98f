use std::collections::{BTreeSet, HashMap};

use log::trace;

use crate::host::descriptor::Descriptor;

/// Map of file handles to file descriptors. Owned by a Host; handles are
/// unique within the host.
pub struct DescriptorTable {
    descriptors: HashMap<u32, Descriptor>,

    // Indices less than `next_index` known to be available.
    available_indices: BTreeSet<u32>,

    // Lowest index not in `available_indices` that *might* be available. We still need to verify
    // availability in `descriptors`, though.
    next_index: u32,
}

impl DescriptorTable {
    pub fn new() -> Self {
        DescriptorTable {
            descriptors: HashMap::new(),
            available_indices: BTreeSet::new(),
            next_index: 0,
        }
    }

    /// Add the descriptor at an unused index, and return the index.
    pub fn add(&mut self, descriptor: Descriptor, min_index: u32) -> u32 {
        let idx = if let Some(idx) = self.available_indices.range(min_index..).next() {
            // Un-borrow from `available_indices`.
            let idx = *idx;
            // Take from `available_indices`
            trace!("Reusing available index {}", idx);
            self.available_indices.remove(&idx);
            idx
        } else {
            // Start our search at either the next likely available index or the minimum index,
            // whichever is larger.
            let mut idx = std::cmp::max(self.next_index, min_index);

            // Only update next_index if we started at it, otherwise there may be other
            // available indexes lower than idx.
            let should_update_next_index = idx == self.next_index;

            // Skip past any indexes that are in use. This can happen after
            // calling `set` with a value greater than `next_index`.
            while self.descriptors.contains_key(&idx) {
                trace!("Skipping past in-use index {}", idx);
                idx += 1;
            }

            if should_update_next_index {
                self.next_index = idx + 1;
            }

            // Take the next index.
            trace!("Using index {}", idx);
            idx
        };

        let prev = self.descriptors.insert(idx, descriptor);
        debug_assert!(prev.is_none(), "Already a descriptor at {}", idx);

        idx
    }

    // Call after inserting to `available_indices`, to free any that are contiguous
    // with `next_index`.
    fn trim_tail(&mut self) {
        while let Some(last_in_available) = self.available_indices.iter().next_back().copied() {
            if (last_in_available + 1) == self.next_index {
                // Last entry in available_indices is adjacent to next_index.
                // We can merge them, freeing an entry in `available_indices`.
                self.next_index -= 1;
                self.available_indices.remove(&last_in_available);
            } else {
                break;
            }
        }
    }

    /// Remove the descriptor at the given index and return it.
    pub fn remove(&mut self, idx: u32) -> Option<Descriptor> {
        let maybe_descriptor = self.descriptors.remove(&idx);
        self.available_indices.insert(idx);
        self.trim_tail();
        maybe_descriptor
    }

    /// Get the descriptor at `idx`, if any.
    pub fn get(&self, idx: u32) -> Option<&Descriptor> {
        self.descriptors.get(&idx)
    }

    /// Get the descriptor at `idx`, if any.
    pub fn get_mut(&mut self, idx: u32) -> Option<&mut Descriptor> {
        self.descriptors.get_mut(&idx)
    }

    /// Insert a descriptor at `index`. If a descriptor is already present at
    /// that index, it is unregistered from that index and returned.
    pub fn set(&mut self, index: u32, descriptor: Descriptor) -> Option<Descriptor> {
        // We ensure the index is no longer in `self.available_indices`. We *don't* ensure
        // `self.next_index` is > `index`, since that'd require adding the indices in between to
        // `self.available_indices`. It uses less memory and is no more expensive to iterate when
        // *using* `self.available_indices` instead.
        self.available_indices.remove(&index);

        if let Some(prev) = self.descriptors.insert(index, descriptor) {
            trace!("Overwriting index {}", index);
            Some(prev)
        } else {
            trace!("Setting to unused index {}", index);
            None
        }
    }

    /// Remove and return all descriptors.
    pub fn remove_all(&mut self) -> impl Iterator<Item = Descriptor> {
        // reset the descriptor table
        let old_self = std::mem::replace(self, Self::new());
        // return the old descriptors
        old_self.descriptors.into_values()
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use atomic_refcell::AtomicRefCell;

    use super::*;
    use crate::host::descriptor::eventfd::EventFd;
    use crate::host::descriptor::{File, FileStatus, OpenFile};

    fn new_descriptor() -> Descriptor {
        let eventfd = Arc::new(AtomicRefCell::new(EventFd::new(0, false, FileStatus::empty())));
        Descriptor::new(OpenFile::new(File::EventFd(eventfd)))
    }

    #[test]
    fn test_add_remove_reuse() {
        let mut table = DescriptorTable::new();

        let a = table.add(new_descriptor(), 3);
        let b = table.add(new_descriptor(), 3);
        let c = table.add(new_descriptor(), 3);
        assert_eq!((a, b, c), (3, 4, 5));

        assert!(table.remove(b).is_some());
        assert!(table.get(b).is_none());

        // the lowest available index is reused
        let d = table.add(new_descriptor(), 3);
        assert_eq!(d, b);
    }

    #[test]
    fn test_min_index() {
        let mut table = DescriptorTable::new();

        let a = table.add(new_descriptor(), 0);
        assert_eq!(a, 0);
        let b = table.add(new_descriptor(), 10);
        assert_eq!(b, 10);
        // still fills the gap below
        let c = table.add(new_descriptor(), 1);
        assert_eq!(c, 1);
    }

    #[test]
    fn test_set_overwrites() {
        let mut table = DescriptorTable::new();

        let idx = table.add(new_descriptor(), 0);
        assert!(table.set(idx, new_descriptor()).is_some());
        assert!(table.set(idx + 1, new_descriptor()).is_none());
    }

    #[test]
    fn test_remove_all() {
        let mut table = DescriptorTable::new();
        table.add(new_descriptor(), 0);
        table.add(new_descriptor(), 0);

        assert_eq!(table.remove_all().count(), 2);
        assert!(table.get(0).is_none());
    }
}
