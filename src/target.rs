//! Target address-space numbering tables.
//!
//! Pointer types carry a raw address-space number; what that number means is
//! a target convention. Two tables are supported, one matching the SPIR
//! numbering and one matching NVPTX. The active table is chosen through
//! `ClampConfig` and both mappings are exact.

use crate::ir::AddressSpace;

/// Logical memory regions of the execution model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryRegion {
    /// Per-work-item memory (stack allocations).
    Private,
    /// Host-shared device memory.
    Global,
    /// Read-only memory.
    Constant,
    /// Work-group shared memory.
    Local,
    /// Unqualified pointers.
    Generic,
}

/// A concrete region-to-number assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpaceMap {
    name: &'static str,
    private: u32,
    global: u32,
    constant: u32,
    local: u32,
    generic: u32,
}

impl AddressSpaceMap {
    /// The SPIR convention.
    pub const SPIR: AddressSpaceMap = AddressSpaceMap {
        name: "spir",
        private: 0,
        global: 1,
        constant: 2,
        local: 3,
        generic: 4,
    };

    /// The NVPTX convention.
    pub const NVPTX: AddressSpaceMap = AddressSpaceMap {
        name: "nvptx",
        private: 5,
        global: 1,
        constant: 4,
        local: 3,
        generic: 0,
    };

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The address-space number assigned to `region`.
    pub fn space(&self, region: MemoryRegion) -> AddressSpace {
        let n = match region {
            MemoryRegion::Private => self.private,
            MemoryRegion::Global => self.global,
            MemoryRegion::Constant => self.constant,
            MemoryRegion::Local => self.local,
            MemoryRegion::Generic => self.generic,
        };
        AddressSpace(n)
    }

    /// The logical region behind an address-space number, if the table
    /// assigns one.
    pub fn region(&self, space: AddressSpace) -> Option<MemoryRegion> {
        let regions = [
            (self.private, MemoryRegion::Private),
            (self.global, MemoryRegion::Global),
            (self.constant, MemoryRegion::Constant),
            (self.local, MemoryRegion::Local),
            (self.generic, MemoryRegion::Generic),
        ];
        regions
            .iter()
            .find(|(n, _)| *n == space.0)
            .map(|(_, r)| *r)
    }
}
