//! Bounded table mapping small wire-visible IDs to open host resources.
//!
//! Raw host pointers and descriptors never cross the wire for files and
//! directories; the target only ever sees a 1-based slot ID, with 0
//! reserved to mean "no handle".

use std::fs::{File, ReadDir};

/// Maximum number of simultaneously open file/directory handles.
pub const MAX_HANDLES: usize = 100;

/// A host resource owned by one handle table slot.
#[derive(Debug)]
pub enum Resource {
    /// An open file, with the sticky error flag backing `FERROR`.
    File {
        /// The open file.
        file: File,
        /// Set when a read/write/seek/tell on this handle fails.
        error: bool,
    },
    /// An open directory iterator.
    Dir(ReadDir),
}

/// Fixed-size table of open resources addressed by 1-based IDs.
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Option<Resource>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    /// Creates an empty table with all [`MAX_HANDLES`] slots free.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_HANDLES).map(|_| None).collect(),
        }
    }

    /// Whether every slot is occupied.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Stores `resource` in the first free slot and returns its 1-based ID,
    /// or `None` if the table is exhausted.
    pub fn allocate(&mut self, resource: Resource) -> Option<u32> {
        let index = self.slots.iter().position(Option::is_none)?;
        self.slots[index] = Some(resource);
        #[allow(clippy::cast_possible_truncation)]
        Some(index as u32 + 1)
    }

    /// Returns the resource stored under `id`, iff the ID is in range and
    /// the slot is in use.
    #[must_use]
    pub fn get_mut(&mut self, id: u32) -> Option<&mut Resource> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        self.slots.get_mut(index)?.as_mut()
    }

    /// Frees the slot under `id`, returning its resource so the caller can
    /// close it. Releasing a free slot (or an out-of-range ID) yields
    /// `None` so double-close stays deterministic.
    pub fn release(&mut self, id: u32) -> Option<Resource> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        self.slots.get_mut(index)?.take()
    }
}
