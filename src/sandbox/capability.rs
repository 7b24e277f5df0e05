//! Capability handle table
//!
//! Guests never see host pointers. Every resource they can touch is named by
//! an opaque 64-bit [`Handle`] that packs a slot index and a generation
//! counter:
//!
//! ```text
//! 63            32 31             0
//! +---------------+---------------+
//! |  generation   |     index     |
//! +---------------+---------------+
//! ```
//!
//! Recycling a slot bumps its generation, so any copy of an old handle stops
//! resolving the moment its slot is freed. Fresh slots start at generation 1,
//! which keeps every live handle distinct from [`Handle::NIL`].
//!
//! Free slots form an intrusive LIFO list threaded through the slots
//! themselves; allocation and recycling are O(1). The table never grows past
//! its configured capacity.

use crate::io::abi::IoErrorKind;
use crate::io::file::FileCapability;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Default number of capability slots
pub const DEFAULT_CAPACITY: usize = 256;

/// Opaque guest-visible capability handle
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(u64);

impl Handle {
    /// The reserved "no capability" handle
    pub const NIL: Handle = Handle(0);

    pub fn new(index: u32, generation: u32) -> Self {
        Handle(((generation as u64) << 32) | index as u64)
    }

    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn index(self) -> u32 {
        self.0 as u32
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn is_nil(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "Handle(nil)")
        } else {
            write!(f, "Handle({}v{})", self.index(), self.generation())
        }
    }
}

/// Host-side reference to a slot that has already passed validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRef(u32);

impl SlotRef {
    pub fn index(self) -> u32 {
        self.0
    }
}

/// A host resource reachable through a capability handle
#[derive(Debug)]
pub enum Capability {
    File(FileCapability),
}

/// Capability table errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("capability table exhausted ({capacity} slots in use)")]
    Exhausted { capacity: usize },

    #[error("stale or invalid capability handle {handle:?}")]
    StaleHandle { handle: Handle },
}

impl CapabilityError {
    /// The I/O error code reported to the guest
    pub fn io_error(self) -> IoErrorKind {
        match self {
            CapabilityError::Exhausted { .. } => IoErrorKind::MaxFiles,
            CapabilityError::StaleHandle { .. } => IoErrorKind::Handle,
        }
    }
}

/// One entry of the table
#[derive(Debug)]
pub struct CapabilitySlot {
    generation: u32,
    live: bool,
    next_free: Option<u32>,
    /// The resource; `None` when the acquisition that created the slot failed
    pub resource: Option<Capability>,
    /// Last error recorded against this handle
    pub error: IoErrorKind,
    /// Set when the handle is unusable; later operations report `Prev`
    pub fatal: bool,
}

impl CapabilitySlot {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Record an error against this slot
    pub fn set_error(&mut self, error: IoErrorKind) {
        self.error = error;
    }

    /// Record an error that makes the handle permanently unusable
    pub fn set_fatal(&mut self, error: IoErrorKind) {
        self.error = error;
        self.fatal = true;
    }

    pub fn file(&self) -> Option<&FileCapability> {
        match &self.resource {
            Some(Capability::File(file)) => Some(file),
            None => None,
        }
    }

    pub fn file_mut(&mut self) -> Option<&mut FileCapability> {
        match &mut self.resource {
            Some(Capability::File(file)) => Some(file),
            None => None,
        }
    }
}

/// Generation-counted table of capability slots
#[derive(Debug)]
pub struct CapabilityTable {
    slots: Vec<CapabilitySlot>,
    capacity: usize,
    free_head: Option<u32>,
    live: usize,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        Self {
            slots: Vec::new(),
            capacity,
            free_head: None,
            live: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Claim a slot, reusing the most recently freed one first
    ///
    /// The slot keeps its generation; error, fatal flag and resource are
    /// reset.
    pub fn allocate(&mut self) -> Result<SlotRef, CapabilityError> {
        let index = match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                self.free_head = slot.next_free.take();
                index
            }
            None if self.slots.len() < self.capacity => {
                self.slots.push(CapabilitySlot {
                    generation: 1,
                    live: false,
                    next_free: None,
                    resource: None,
                    error: IoErrorKind::Ok,
                    fatal: false,
                });
                (self.slots.len() - 1) as u32
            }
            None => {
                warn!(capacity = self.capacity, "capability table exhausted");
                return Err(CapabilityError::Exhausted {
                    capacity: self.capacity,
                });
            }
        };

        let slot = &mut self.slots[index as usize];
        slot.live = true;
        slot.resource = None;
        slot.error = IoErrorKind::Ok;
        slot.fatal = false;
        self.live += 1;

        Ok(SlotRef(index))
    }

    /// Handle naming `slot` at its current generation
    pub fn handle_from_slot(&self, slot: SlotRef) -> Handle {
        Handle::new(slot.0, self.slots[slot.0 as usize].generation)
    }

    /// Resolve a guest handle to a live slot
    ///
    /// Fails for the nil handle, out-of-range indices, generation mismatches,
    /// and handles naming a slot that is currently free.
    pub fn slot_from_handle(&self, handle: Handle) -> Result<SlotRef, CapabilityError> {
        match self.slots.get(handle.index() as usize) {
            Some(slot)
                if !handle.is_nil() && slot.live && slot.generation == handle.generation() =>
            {
                Ok(SlotRef(handle.index()))
            }
            _ => Err(CapabilityError::StaleHandle { handle }),
        }
    }

    /// Free a slot and return the resource it held
    ///
    /// Bumping the generation invalidates every outstanding handle to it.
    pub fn recycle(&mut self, slot: SlotRef) -> Option<Capability> {
        let entry = &mut self.slots[slot.0 as usize];
        if !entry.live {
            return None;
        }

        entry.generation = entry.generation.wrapping_add(1).max(1);
        entry.live = false;
        entry.fatal = false;
        entry.error = IoErrorKind::Ok;
        entry.next_free = self.free_head;
        self.free_head = Some(slot.0);
        self.live -= 1;

        entry.resource.take()
    }

    pub fn get(&self, slot: SlotRef) -> &CapabilitySlot {
        &self.slots[slot.0 as usize]
    }

    pub fn get_mut(&mut self, slot: SlotRef) -> &mut CapabilitySlot {
        &mut self.slots[slot.0 as usize]
    }

    /// Resolve and borrow in one step
    pub fn lookup(&self, handle: Handle) -> Result<&CapabilitySlot, CapabilityError> {
        self.slot_from_handle(handle).map(|slot| self.get(slot))
    }

    pub fn lookup_mut(&mut self, handle: Handle) -> Result<&mut CapabilitySlot, CapabilityError> {
        let slot = self.slot_from_handle(handle)?;
        Ok(self.get_mut(slot))
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::new()
    }
}
