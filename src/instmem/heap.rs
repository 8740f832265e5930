use super::{InstanceBacking, InstanceNode, NodeResource};
use crate::device::IoMem;
use crate::device::regs::PAGE_SIZE;
use crate::error::InstmemResult;
use crate::mm::RangeAllocator;
use log::error;
use std::fmt;
use std::sync::Arc;

/// Instance objects carved from a reserved region at the start of VRAM, read and
/// written directly through the mapped PRAMIN BAR.
pub struct HeapBacking {
    heap: RangeAllocator,
    iomem: Arc<dyn IoMem>,
}

impl HeapBacking {
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `reserved` is zero or not page aligned.
    pub fn new(reserved: u64, iomem: Arc<dyn IoMem>) -> InstmemResult<Self> {
        Ok(Self {
            heap: RangeAllocator::new("instmem heap", 0, reserved, PAGE_SIZE)?,
            iomem,
        })
    }

    #[must_use]
    pub const fn heap(&self) -> &RangeAllocator {
        &self.heap
    }
}

impl InstanceBacking for HeapBacking {
    fn allocate(&self, size: u64, align: u64) -> InstmemResult<InstanceNode> {
        let range = self.heap.reserve(size, align).inspect_err(|e| {
            error!("instmem heap exhausted: {e}");
        })?;
        Ok(InstanceNode::new(range.base, size, NodeResource::Heap(range)))
    }

    fn free(&self, node: &InstanceNode) {
        if let NodeResource::Heap(range) = node.resource {
            self.heap.release(range);
        }
    }

    fn rd32(&self, node: &InstanceNode, offset: u64) -> u32 {
        self.iomem.rd32(node.offset + offset)
    }

    fn wr32(&self, node: &InstanceNode, offset: u64, data: u32) {
        self.iomem.wr32(node.offset + offset, data);
    }
}

impl fmt::Debug for HeapBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBacking")
            .field("heap", &self.heap.bounds())
            .field("bar_len", &self.iomem.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Platform;
    use crate::device::regs::PRAMIN_BAR_PRIMARY;
    use crate::device::sim::{SimConfig, SimDevice};
    use crate::error::InstmemError;

    fn backing(reserved: u64) -> (SimDevice, HeapBacking) {
        let device = SimDevice::new(SimConfig::dedicated_vram(0x47)).unwrap();
        let bar = device.map_resource(PRAMIN_BAR_PRIMARY).unwrap();
        let heap = HeapBacking::new(reserved, bar).unwrap();
        (device, heap)
    }

    #[test]
    fn objects_are_packed_from_zero() {
        let (_device, heap) = backing(0x10_0000);

        let a = heap.allocate(0x10000, 0x1000).unwrap();
        let b = heap.allocate(0x2000, 0x1000).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 0x10000);

        heap.free(&a);
        heap.free(&b);
        assert!(heap.heap().is_idle());
    }

    #[test]
    fn writes_reach_vram() {
        let (device, heap) = backing(0x10_0000);

        let _pad = heap.allocate(0x3000, 0x1000).unwrap();
        let node = heap.allocate(0x1000, 0x1000).unwrap();
        heap.wr32(&node, 0x10, 0xcafe_f00d);

        assert_eq!(heap.rd32(&node, 0x10), 0xcafe_f00d);
        assert_eq!(device.vram().rd32(0x3010), 0xcafe_f00d);
    }

    #[test]
    fn exhaustion_is_reported() {
        let (_device, heap) = backing(0x4000);

        let _all = heap.allocate(0x4000, 0x1000).unwrap();
        assert_eq!(
            heap.allocate(0x1000, 0x1000).unwrap_err(),
            InstmemError::OutOfAddressSpace {
                size: 0x1000,
                align: 0x1000
            }
        );
    }
}
