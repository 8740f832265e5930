use super::pramin::Pramin;
use super::{InstanceBacking, InstanceNode, NodeResource};
use crate::device::{DmaAllocator, DmaAttrs};
use crate::error::{InstmemError, InstmemResult};
use crate::utils::is_aligned;
use log::{error, warn};
use std::fmt;
use std::sync::Arc;

/// Instance memory needs no CPU mapping and tolerates relaxed ordering.
pub const INSTMEM_DMA_ATTRS: DmaAttrs = DmaAttrs::NON_CONSISTENT
    .union(DmaAttrs::WEAK_ORDERING)
    .union(DmaAttrs::WRITE_COMBINE)
    .union(DmaAttrs::NO_KERNEL_MAPPING);

/// Instance objects backed by physically contiguous buffers from the platform
/// DMA allocator.
pub struct DmaBacking {
    dma: Arc<dyn DmaAllocator>,
    attrs: DmaAttrs,
    pramin: Arc<Pramin>,
}

impl DmaBacking {
    #[must_use]
    pub fn new(dma: Arc<dyn DmaAllocator>, pramin: Arc<Pramin>) -> Self {
        Self {
            dma,
            attrs: INSTMEM_DMA_ATTRS,
            pramin,
        }
    }

    #[must_use]
    pub const fn attrs(&self) -> DmaAttrs {
        self.attrs
    }
}

impl InstanceBacking for DmaBacking {
    fn allocate(&self, size: u64, align: u64) -> InstmemResult<InstanceNode> {
        let Some(buffer) = self.dma.alloc(size, self.attrs) else {
            error!("cannot allocate DMA memory");
            return Err(InstmemError::OutOfMemory);
        };

        // The DMA allocator only guarantees page alignment.
        let misaligned = !is_aligned(buffer.handle, align);
        if misaligned {
            warn!(
                "memory not aligned as requested: 0x{:x} (0x{align:x})",
                buffer.handle
            );
        }

        let mut node = InstanceNode::new(buffer.handle, size, NodeResource::Dma(buffer));
        node.misaligned = misaligned;
        Ok(node)
    }

    fn free(&self, node: &InstanceNode) {
        if let NodeResource::Dma(buffer) = node.resource {
            self.dma.free(buffer, self.attrs);
        }
    }

    fn rd32(&self, node: &InstanceNode, offset: u64) -> u32 {
        self.pramin.rd32(node.offset + offset)
    }

    fn wr32(&self, node: &InstanceNode, offset: u64, data: u32) {
        self.pramin.wr32(node.offset + offset, data);
    }
}

impl fmt::Debug for DmaBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBacking")
            .field("attrs", &self.attrs)
            .finish_non_exhaustive()
    }
}
