//! Sizing of the instance memory heap reserved at the start of dedicated VRAM on
//! Curie-class chipsets.

use crate::device::RegisterIo;
use crate::device::regs::{
    NV_PGRAPH_UNIT_CONFIG, NV_PGRAPH_UNIT_CONFIG_VS_MASK, NV_PGRAPH_UNIT_CONFIG_VS_SHIFT,
    PAGE_SIZE,
};
use crate::mm::AddressRange;
use crate::utils::{hweight8, round_up};

pub const VBIOS_SIZE: u64 = 0x10000;
pub const RAMHT_SIZE: u64 = 0x8000;
pub const RAMRO_SIZE: u64 = 0x8000;
pub const RAMFC_SIZE: u64 = 0x20000;

const CHANNELS: u64 = 32;
const CHANNEL_PAD: u64 = 16 * 1024;
/// PCI GART page table.
const GART_TABLE_SIZE: u64 = 512 * 1024;
/// Object storage outside the per-channel area.
const OBJECT_STORAGE_SIZE: u64 = 512 * 1024;

/// Low nibbles of the 0x4x chipsets outside the nv44 graphics class.
const NON_NV44_NIBBLES: u32 = 0x0aaf;

/// Chipsets sharing the nv44 graphics class layout.
#[must_use]
pub const fn is_nv44_class(chipset: u32) -> bool {
    chipset & 0xf0 == 0x60 || NON_NV44_NIBBLES & (1 << (chipset & 0xf)) == 0
}

/// Graphics context bytes per shader unit.
#[must_use]
pub const fn context_size_per_unit(chipset: u32) -> u64 {
    match chipset {
        0x40 => 0x6aa0,
        c if c < 0x43 => 0x4f00,
        c if is_nv44_class(c) => 0x4980,
        _ => 0x4a40,
    }
}

/// Number of enabled vertex shader units.
#[must_use]
pub fn shader_units(regs: &dyn RegisterIo) -> u32 {
    hweight8(
        (regs.rd32(NV_PGRAPH_UNIT_CONFIG) & NV_PGRAPH_UNIT_CONFIG_VS_MASK)
            >> NV_PGRAPH_UNIT_CONFIG_VS_SHIFT,
    )
}

/// The reserved heap and the placement of the fixed objects inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedLayout {
    pub chipset: u32,
    pub shader_units: u32,
    /// Graphics context size of one channel.
    pub context_size: u64,
    /// Size of the heap, starting at offset 0.
    pub reserved: u64,
    pub vbios: AddressRange,
    pub ramht: AddressRange,
    pub ramro: AddressRange,
    pub ramfc: AddressRange,
}

impl ReservedLayout {
    #[must_use]
    pub const fn compute(chipset: u32, shader_units: u32) -> Self {
        let context_size = context_size_per_unit(chipset) * shader_units as u64;
        let reserved = round_up(
            (context_size + CHANNEL_PAD) * CHANNELS + GART_TABLE_SIZE + OBJECT_STORAGE_SIZE,
            PAGE_SIZE,
        );

        // Fixed objects are packed from offset 0 in allocation order.
        let vbios = AddressRange::new(0, VBIOS_SIZE);
        let ramht = AddressRange::new(vbios.end(), RAMHT_SIZE);
        let ramro = AddressRange::new(ramht.end(), RAMRO_SIZE);
        let ramfc = AddressRange::new(ramro.end(), RAMFC_SIZE);

        Self {
            chipset,
            shader_units,
            context_size,
            reserved,
            vbios,
            ramht,
            ramro,
            ramfc,
        }
    }

    /// Bytes of the heap left after the fixed objects.
    #[must_use]
    pub const fn dynamic_bytes(&self) -> u64 {
        self.reserved - self.ramfc.end()
    }
}
