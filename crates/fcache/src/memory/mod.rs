//! Physical memory management: units, their registry, and the provider
//! abstraction that backs them with real address space.

mod provider;
mod registry;
mod unit;

pub use provider::{MemoryProvider, MmapMemoryProvider, Protection};
pub use registry::UnitRegistry;
pub use unit::{FreeEntryId, SlotKind, SlotRecord, Unit, UnitId};

/// Builds a `UnitId` for use in unit tests of other modules that need a
/// stand-in identifier without creating a real registry and reservation.
#[cfg(test)]
pub(crate) fn test_unit_id(index: u32) -> UnitId {
    UnitId {
        index,
        generation: 0,
    }
}
