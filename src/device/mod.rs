//! Collaborator-facing device layer.
//!
//! The instmem core never touches hardware directly. Everything it needs from the
//! surrounding driver (register access, the PRAMIN BAR mapping, system page
//! allocation, the IOMMU and the DMA allocator) comes through the traits below.

pub mod regs;
pub mod sim;

use crate::mm::RangeAllocator;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

// ===============================================================================================
// Chipset Identity
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceFamily {
    Tnt,
    Celsius,
    Kelvin,
    Rankine,
    Curie,
    Tesla,
    Fermi,
    Kepler,
    Maxwell,
    Pascal,
    Unknown,
}

impl DeviceFamily {
    #[must_use]
    pub const fn from_chipset(chipset: u32) -> Self {
        match chipset {
            0x04 | 0x05 => Self::Tnt,
            0x10..=0x1f => Self::Celsius,
            0x20..=0x2f => Self::Kelvin,
            0x30..=0x3f => Self::Rankine,
            0x40..=0x4f | 0x60..=0x6f => Self::Curie,
            0x50 | 0x80..=0xaf => Self::Tesla,
            0xc0..=0xdf => Self::Fermi,
            0xe0..=0xff | 0x100..=0x10f => Self::Kepler,
            0x110..=0x12f => Self::Maxwell,
            0x130..=0x13f => Self::Pascal,
            _ => Self::Unknown,
        }
    }

    /// Families the instmem core knows how to drive.
    #[must_use]
    pub fn is_supported(self) -> bool {
        (Self::Curie..=Self::Maxwell).contains(&self)
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Platform identity queried once at controller construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipsetInfo {
    pub chipset: u32,
    pub family: DeviceFamily,
    /// The device has dedicated video memory.
    pub has_vram: bool,
}

impl ChipsetInfo {
    #[must_use]
    pub const fn new(chipset: u32, has_vram: bool) -> Self {
        Self {
            chipset,
            family: DeviceFamily::from_chipset(chipset),
            has_vram,
        }
    }
}

// ===============================================================================================
// Register and Aperture Access
// ===============================================================================================

/// Raw 32-bit access to the control register range (BAR0).
pub trait RegisterIo: Send + Sync {
    fn rd32(&self, addr: u32) -> u32;
    fn wr32(&self, addr: u32, data: u32);
}

/// A CPU mapping of a PCI resource, addressed by byte offset.
pub trait IoMem: Send + Sync {
    fn rd32(&self, offset: u64) -> u32;
    fn wr32(&self, offset: u64, data: u32);
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ===============================================================================================
// System Memory
// ===============================================================================================

/// A single system page, identified by its physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysPage(pub u64);

pub trait PageAllocator: Send + Sync {
    /// Allocates one `PAGE_SIZE` page. May block.
    fn alloc_page(&self) -> Option<PhysPage>;
    fn free_page(&self, page: PhysPage);
}

bitflags! {
    /// IOMMU mapping permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IommuProt: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// A platform IOMMU translation context already attached to the device.
pub trait IommuDomain: Send + Sync {
    /// Maps `size` bytes at `iova` to `phys`.
    ///
    /// # Errors
    /// Returns a negative errno on failure; nothing is mapped in that case.
    fn map(&self, iova: u64, phys: u64, size: u64, prot: IommuProt) -> Result<(), i32>;

    /// Unmaps `size` bytes at `iova`, returning the number of bytes unmapped.
    fn unmap(&self, iova: u64, size: u64) -> u64;
}

/// The device's IOMMU domain together with the GPU virtual space carved out for it.
#[derive(Clone)]
pub struct IommuContext {
    pub domain: Arc<dyn IommuDomain>,
    pub space: Arc<RangeAllocator>,
}

impl fmt::Debug for IommuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IommuContext")
            .field("space", &self.space.bounds())
            .finish_non_exhaustive()
    }
}

bitflags! {
    /// Attributes passed to the platform DMA allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaAttrs: u32 {
        /// No CPU-coherent mapping is required.
        const NON_CONSISTENT = 1 << 0;
        /// Relaxed ordering is acceptable.
        const WEAK_ORDERING = 1 << 1;
        const WRITE_COMBINE = 1 << 2;
        /// Do not create a kernel virtual mapping.
        const NO_KERNEL_MAPPING = 1 << 3;
    }
}

/// A physically contiguous buffer from the platform DMA allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaBuffer {
    /// Bus address of the first byte.
    pub handle: u64,
    pub size: u64,
}

pub trait DmaAllocator: Send + Sync {
    /// Allocates `size` bytes of contiguous memory. The returned handle is only
    /// guaranteed to be page aligned. May block.
    fn alloc(&self, size: u64, attrs: DmaAttrs) -> Option<DmaBuffer>;
    fn free(&self, buffer: DmaBuffer, attrs: DmaAttrs);
}

// ===============================================================================================
// Platform
// ===============================================================================================

/// Everything the instmem controller consumes from the surrounding driver.
pub trait Platform: Send + Sync {
    fn chipset(&self) -> ChipsetInfo;

    fn registers(&self) -> Arc<dyn RegisterIo>;

    /// Length of PCI resource `bar`, 0 if absent.
    fn resource_len(&self, bar: u8) -> u64;

    /// Maps PCI resource `bar` for CPU access.
    fn map_resource(&self, bar: u8) -> Option<Arc<dyn IoMem>>;

    /// The IOMMU context, if one was established for the device.
    fn iommu(&self) -> Option<IommuContext>;

    fn page_allocator(&self) -> Arc<dyn PageAllocator>;

    fn dma_allocator(&self) -> Arc<dyn DmaAllocator>;
}
