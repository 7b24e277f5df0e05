//! Guest isolation primitives
//!
//! - [`memory`]: the guest's linear memory and the boundary validator every
//!   host function runs guest pointers through
//! - [`capability`]: generation-counted handles naming host resources

pub mod capability;
pub mod memory;

pub use capability::{
    Capability, CapabilityError, CapabilitySlot, CapabilityTable, Handle, SlotRef,
};
pub use memory::{BoundsError, GuestMemory, MemoryError, PAGE_SIZE};
