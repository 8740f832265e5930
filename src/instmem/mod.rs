//! Instance memory: small pinned GPU-addressable objects read directly by the
//! command processor (page tables, RAMHT/RAMRO/RAMFC, channel contexts).
//!
//! An [`InstanceObject`] is carved from one of three backings, chosen once per
//! device by the [`Instmem`](controller::Instmem) controller:
//!
//! - [`HeapBacking`]: a reserved region of dedicated VRAM, directly mapped.
//! - [`IommuBacking`]: system pages made contiguous to the GPU by the IOMMU.
//! - [`DmaBacking`]: physically contiguous system memory from the DMA allocator.
//!
//! The two system-memory backings keep no CPU mapping; their accessors go through
//! the [`Pramin`] window so that reads and writes stay coherent with the GPU.

pub mod controller;
pub mod dma;
pub mod heap;
pub mod iommu;
pub mod layout;
pub mod pramin;

use crate::device::regs::{PAGE_SHIFT, PAGE_SIZE};
use crate::device::{DmaBuffer, PhysPage};
use crate::error::{InstmemError, InstmemResult};
use crate::mm::AddressRange;
use bitflags::bitflags;
use log::debug;
use std::fmt;
use std::sync::Arc;

pub use controller::{FixedObjects, Instmem, InstmemState};
pub use dma::DmaBacking;
pub use heap::HeapBacking;
pub use iommu::IommuBacking;
pub use layout::ReservedLayout;
pub use pramin::Pramin;

bitflags! {
    /// Per-allocation behaviour.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstFlags: u32 {
        /// Zero-fill the object before handing it out.
        const ZERO = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Heap,
    Iommu,
    Dma,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Heap => "VRAM heap",
            Self::Iommu => "IOMMU",
            Self::Dma => "DMA API",
        })
    }
}

// ===============================================================================================
// Memory Descriptors
// ===============================================================================================

/// One physically or IOMMU-contiguous run of small pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRegion {
    pub page_shift: u8,
    /// First page number.
    pub offset: u64,
    /// Length in pages.
    pub length: u64,
}

/// How downstream VM code maps an instance object. Every instance object is
/// presented as small pages with the default memory type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemDescriptor {
    /// GPU address of the first byte.
    pub offset: u64,
    /// Size in small pages.
    pub size: u64,
    pub page_shift: u8,
    pub memtype: u32,
    pub regions: Vec<MemRegion>,
}

impl MemDescriptor {
    #[allow(clippy::cast_possible_truncation)]
    fn single_node(offset: u64, size: u64) -> Self {
        let page_shift = PAGE_SHIFT as u8;
        Self {
            offset,
            size: size >> PAGE_SHIFT,
            page_shift,
            memtype: 0,
            regions: vec![MemRegion {
                page_shift,
                offset: offset >> PAGE_SHIFT,
                length: size >> PAGE_SHIFT,
            }],
        }
    }
}

// ===============================================================================================
// Backings
// ===============================================================================================

/// Backing-specific resources of one live object.
#[derive(Debug)]
pub(crate) enum NodeResource {
    Heap(AddressRange),
    Iommu {
        range: AddressRange,
        pages: Vec<PhysPage>,
    },
    Dma(DmaBuffer),
}

/// What a backing hands back for one allocation.
#[derive(Debug)]
pub(crate) struct InstanceNode {
    offset: u64,
    size: u64,
    misaligned: bool,
    mem: MemDescriptor,
    resource: NodeResource,
}

impl InstanceNode {
    fn new(offset: u64, size: u64, resource: NodeResource) -> Self {
        Self {
            offset,
            size,
            misaligned: false,
            mem: MemDescriptor::single_node(offset, size),
            resource,
        }
    }
}

/// The capability set shared by every backing.
///
/// `size` and `align` passed to `allocate` are already page rounded. `offset`
/// passed to the accessors is a byte offset inside the object.
pub(crate) trait InstanceBacking {
    fn allocate(&self, size: u64, align: u64) -> InstmemResult<InstanceNode>;
    fn free(&self, node: &InstanceNode);
    fn rd32(&self, node: &InstanceNode, offset: u64) -> u32;
    fn wr32(&self, node: &InstanceNode, offset: u64, data: u32);
}

/// The backing selected for a device.
#[derive(Debug)]
pub enum Backing {
    Heap(HeapBacking),
    Iommu(IommuBacking),
    Dma(DmaBacking),
}

impl Backing {
    #[must_use]
    pub const fn strategy(&self) -> Strategy {
        match self {
            Self::Heap(_) => Strategy::Heap,
            Self::Iommu(_) => Strategy::Iommu,
            Self::Dma(_) => Strategy::Dma,
        }
    }
}

/// Rounds a request to page bounds; a zero size still takes one page.
fn page_round(size: u64, align: u64) -> InstmemResult<(u64, u64)> {
    let overflow = InstmemError::OutOfAddressSpace { size, align };
    let rounded_size = size
        .max(1)
        .checked_next_multiple_of(PAGE_SIZE)
        .ok_or_else(|| overflow.clone())?;
    let rounded_align = align
        .max(1)
        .checked_next_multiple_of(PAGE_SIZE)
        .ok_or(overflow)?;

    if !rounded_align.is_power_of_two() {
        return Err(InstmemError::InvalidArgument(format!(
            "alignment 0x{align:x} is not a power of two"
        )));
    }
    Ok((rounded_size, rounded_align))
}

impl InstanceBacking for Backing {
    fn allocate(&self, size: u64, align: u64) -> InstmemResult<InstanceNode> {
        debug!(
            "instobj ({}): size: 0x{size:x} align: 0x{align:x}",
            self.strategy()
        );

        let (size, align) = page_round(size, align)?;
        let node = match self {
            Self::Heap(heap) => heap.allocate(size, align),
            Self::Iommu(iommu) => iommu.allocate(size, align),
            Self::Dma(dma) => dma.allocate(size, align),
        }?;

        debug!(
            "alloc size: 0x{size:x}, align: 0x{align:x}, gaddr: 0x{:x}",
            node.offset
        );
        Ok(node)
    }

    fn free(&self, node: &InstanceNode) {
        match self {
            Self::Heap(heap) => heap.free(node),
            Self::Iommu(iommu) => iommu.free(node),
            Self::Dma(dma) => dma.free(node),
        }
    }

    fn rd32(&self, node: &InstanceNode, offset: u64) -> u32 {
        match self {
            Self::Heap(heap) => heap.rd32(node, offset),
            Self::Iommu(iommu) => iommu.rd32(node, offset),
            Self::Dma(dma) => dma.rd32(node, offset),
        }
    }

    fn wr32(&self, node: &InstanceNode, offset: u64, data: u32) {
        match self {
            Self::Heap(heap) => heap.wr32(node, offset, data),
            Self::Iommu(iommu) => iommu.wr32(node, offset, data),
            Self::Dma(dma) => dma.wr32(node, offset, data),
        }
    }
}

// ===============================================================================================
// Instance Objects
// ===============================================================================================

/// A RAII handle to one instance object.
///
/// The object owns its backing resources until dropped; dropping it unmaps and
/// frees everything and returns its range to the allocator it came from. It keeps
/// the backing alive, so it stays valid even if the controller is torn down first.
pub struct InstanceObject {
    node: InstanceNode,
    backing: Arc<Backing>,
}

impl InstanceObject {
    pub(crate) fn new(backing: Arc<Backing>, size: u64, align: u64) -> InstmemResult<Self> {
        let node = backing.allocate(size, align)?;
        Ok(Self { node, backing })
    }

    /// GPU address of the first byte.
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.node.offset
    }

    /// Page-rounded size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.node.size
    }

    #[must_use]
    pub const fn page_shift(&self) -> u8 {
        self.node.mem.page_shift
    }

    #[must_use]
    pub const fn mem(&self) -> &MemDescriptor {
        &self.node.mem
    }

    /// The platform returned memory less aligned than requested.
    #[must_use]
    pub const fn is_misaligned(&self) -> bool {
        self.node.misaligned
    }

    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.backing.strategy()
    }

    fn check_access(&self, offset: u64, words: usize) {
        debug_assert!(offset % 4 == 0, "unaligned instance access at 0x{offset:x}");
        debug_assert!(
            offset + words as u64 * 4 <= self.node.size,
            "instance access at 0x{offset:x} (+{words} words) past size 0x{:x}",
            self.node.size
        );
    }

    #[must_use]
    pub fn rd32(&self, offset: u64) -> u32 {
        self.check_access(offset, 1);
        self.backing.rd32(&self.node, offset)
    }

    pub fn wr32(&self, offset: u64, data: u32) {
        self.check_access(offset, 1);
        self.backing.wr32(&self.node, offset, data);
    }

    /// Reads consecutive words starting at `offset`.
    pub fn read_words(&self, offset: u64, out: &mut [u32]) {
        self.check_access(offset, out.len());
        for (addr, word) in (offset..).step_by(4).zip(out.iter_mut()) {
            *word = self.backing.rd32(&self.node, addr);
        }
    }

    /// Writes consecutive words starting at `offset`.
    pub fn write_words(&self, offset: u64, data: &[u32]) {
        self.check_access(offset, data.len());
        for (addr, &word) in (offset..).step_by(4).zip(data) {
            self.backing.wr32(&self.node, addr, word);
        }
    }

    /// Fills the whole object with `value`.
    pub fn fill(&self, value: u32) {
        for addr in (0..self.node.size).step_by(4) {
            self.backing.wr32(&self.node, addr, value);
        }
    }
}

impl Drop for InstanceObject {
    fn drop(&mut self) {
        self.backing.free(&self.node);
    }
}

impl fmt::Debug for InstanceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceObject")
            .field("strategy", &self.strategy())
            .field("offset", &format_args!("0x{:x}", self.node.offset))
            .field("size", &format_args!("0x{:x}", self.node.size))
            .field("misaligned", &self.node.misaligned)
            .finish()
    }
}
