// ===============================================================================================
// Control Registers
// ===============================================================================================

/// PGRAPH unit configuration; bits 8..15 carry the enabled shader-unit mask.
pub const NV_PGRAPH_UNIT_CONFIG: u32 = 0x0000_1540;
pub const NV_PGRAPH_UNIT_CONFIG_VS_MASK: u32 = 0x0000_ff00;
pub const NV_PGRAPH_UNIT_CONFIG_VS_SHIFT: u32 = 8;

/// PRAMIN window select. Takes the window base shifted right by 16.
pub const NV_PBUS_BAR0_WINDOW: u32 = 0x0000_1700;
pub const NV_PBUS_BAR0_WINDOW_SHIFT: u32 = 16;

// ===============================================================================================
// PRAMIN Aperture
// ===============================================================================================

/// Start of the indirect aperture inside the control register range.
pub const NV_PRAMIN: u32 = 0x0070_0000;
pub const PRAMIN_WINDOW_SHIFT: u32 = 20;
pub const PRAMIN_WINDOW_SIZE: u64 = 1 << PRAMIN_WINDOW_SHIFT;
/// Window bases are 1 MiB granular within a 44-bit instance address space.
pub const PRAMIN_WINDOW_MASK: u64 = 0x0000_0fff_fff0_0000;
pub const PRAMIN_OFFSET_MASK: u64 = PRAMIN_WINDOW_SIZE - 1;

// ===============================================================================================
// Instance Address Space
// ===============================================================================================

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Set in a GPU address to have it resolved through the IOMMU.
pub const IOMMU_ADDR_BIT: u32 = 34;
pub const IOMMU_ADDR_FLAG: u64 = 1 << IOMMU_ADDR_BIT;

#[must_use]
pub const fn is_iommu_address(addr: u64) -> bool {
    addr & IOMMU_ADDR_FLAG != 0
}

#[must_use]
pub const fn strip_iommu_bit(addr: u64) -> u64 {
    addr & !IOMMU_ADDR_FLAG
}

/// PCI resources that may carry the PRAMIN BAR, in order of preference.
pub const PRAMIN_BAR_PRIMARY: u8 = 2;
pub const PRAMIN_BAR_FALLBACK: u8 = 3;
