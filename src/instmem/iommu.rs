use super::pramin::Pramin;
use super::{InstanceBacking, InstanceNode, NodeResource};
use crate::device::regs::{IOMMU_ADDR_FLAG, PAGE_SIZE};
use crate::device::{IommuContext, IommuDomain, IommuProt, PageAllocator};
use crate::error::{InstmemError, InstmemResult};
use crate::mm::RangeAllocator;
use log::error;
use std::fmt;
use std::sync::Arc;

/// Cleanup actions for a partially built allocation, run newest first unless
/// the allocation is committed.
struct UndoStack<'a> {
    actions: Vec<Box<dyn FnOnce() + 'a>>,
}

impl<'a> UndoStack<'a> {
    fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    fn push(&mut self, action: impl FnOnce() + 'a) {
        self.actions.push(Box::new(action));
    }

    fn commit(mut self) {
        self.actions.clear();
    }
}

impl Drop for UndoStack<'_> {
    fn drop(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

/// Instance objects built from individually allocated system pages, mapped
/// contiguously into the device's IOMMU space.
///
/// Addresses handed out carry [`IOMMU_ADDR_FLAG`] so the GPU resolves them
/// through the IOMMU.
pub struct IommuBacking {
    domain: Arc<dyn IommuDomain>,
    space: Arc<RangeAllocator>,
    pages: Arc<dyn PageAllocator>,
    pramin: Arc<Pramin>,
}

impl IommuBacking {
    #[must_use]
    pub fn new(ctx: IommuContext, pages: Arc<dyn PageAllocator>, pramin: Arc<Pramin>) -> Self {
        Self {
            domain: ctx.domain,
            space: ctx.space,
            pages,
            pramin,
        }
    }

    /// The IOMMU virtual space objects are placed in.
    #[must_use]
    pub fn space(&self) -> &RangeAllocator {
        &self.space
    }
}

impl InstanceBacking for IommuBacking {
    fn allocate(&self, size: u64, align: u64) -> InstmemResult<InstanceNode> {
        // No pages are taken for a request the space can never hold.
        if size > self.space.capacity() {
            error!("virtual space is full!");
            return Err(InstmemError::OutOfAddressSpace { size, align });
        }

        let npages = size / PAGE_SIZE;
        let mut undo = UndoStack::new();

        let mut pages = Vec::new();
        for i in 0..npages {
            let Some(page) = self.pages.alloc_page() else {
                error!("cannot allocate page {i} of {npages}");
                return Err(InstmemError::OutOfMemory);
            };
            pages.push(page);
            undo.push(move || self.pages.free_page(page));
        }

        let range = self.space.reserve(size, align).inspect_err(|_| {
            error!("virtual space is full!");
        })?;
        undo.push(move || self.space.release(range));

        for (iova, &page) in (range.base..).step_by(PAGE_SIZE as usize).zip(&pages) {
            if let Err(errno) = self.domain.map(
                iova,
                page.0,
                PAGE_SIZE,
                IommuProt::READ | IommuProt::WRITE,
            ) {
                error!("IOMMU mapping failure: {errno}");
                return Err(InstmemError::PlatformAllocationFailed(format!(
                    "IOMMU map of 0x{iova:x} failed: errno {errno}"
                )));
            }
            undo.push(move || {
                self.domain.unmap(iova, PAGE_SIZE);
            });
        }
        undo.commit();

        Ok(InstanceNode::new(
            range.base | IOMMU_ADDR_FLAG,
            size,
            NodeResource::Iommu { range, pages },
        ))
    }

    fn free(&self, node: &InstanceNode) {
        let NodeResource::Iommu { range, pages } = &node.resource else {
            return;
        };
        for (iova, &page) in (range.base..).step_by(PAGE_SIZE as usize).zip(pages) {
            self.domain.unmap(iova, PAGE_SIZE);
            self.pages.free_page(page);
        }
        self.space.release(*range);
    }

    fn rd32(&self, node: &InstanceNode, offset: u64) -> u32 {
        self.pramin.rd32(node.offset + offset)
    }

    fn wr32(&self, node: &InstanceNode, offset: u64, data: u32) {
        self.pramin.wr32(node.offset + offset, data);
    }
}

impl fmt::Debug for IommuBacking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IommuBacking")
            .field("space", &self.space.bounds())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
impl InstanceNode {
    fn iommu_pages(&self) -> Option<&[crate::device::PhysPage]> {
        match &self.resource {
            NodeResource::Iommu { pages, .. } => Some(pages),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::regs::is_iommu_address;
    use crate::device::sim::{SimConfig, SimDevice};
    use crate::device::{PhysPage, Platform};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    fn backing() -> (SimDevice, IommuBacking) {
        let device = SimDevice::new(SimConfig::system_memory(0xea).with_iommu(1 << 24)).unwrap();
        let pramin = Arc::new(Pramin::new(device.registers()));
        let iommu = IommuBacking::new(
            device.iommu().unwrap(),
            device.page_allocator(),
            pramin,
        );
        (device, iommu)
    }

    #[test]
    fn pages_are_mapped_contiguously() {
        let (device, iommu) = backing();

        let node = iommu.allocate(0x4000, 0x1000).unwrap();
        assert!(is_iommu_address(node.offset));
        assert_eq!(node.offset & !IOMMU_ADDR_FLAG, 0);

        let domain = device.iommu_domain().unwrap();
        let pages = node.iommu_pages().unwrap();
        assert_eq!(pages.len(), 4);
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(domain.translate(i as u64 * PAGE_SIZE), Some(page.0));
        }

        iommu.free(&node);
        assert_eq!(domain.mapped_pages(), 0);
        assert_eq!(device.system_memory().live_pages(), 0);
        assert!(iommu.space().is_idle());
    }

    #[test]
    fn accesses_go_through_the_iommu() {
        let (device, iommu) = backing();

        let node = iommu.allocate(0x2000, 0x1000).unwrap();
        iommu.wr32(&node, 0x1004, 0x1234_5678);

        let second = node.iommu_pages().unwrap()[1];
        assert_eq!(device.system_memory().rd32(second.0 + 4), Some(0x1234_5678));
        assert_eq!(iommu.rd32(&node, 0x1004), 0x1234_5678);

        iommu.free(&node);
    }

    #[test]
    fn page_failure_releases_earlier_pages() {
        let (device, iommu) = backing();
        device.fail_page_alloc_after(2);

        assert_eq!(
            iommu.allocate(0x4000, 0x1000).unwrap_err(),
            InstmemError::OutOfMemory
        );
        assert_eq!(device.system_memory().live_pages(), 0);
        assert!(iommu.space().is_idle());
    }

    #[test]
    fn map_failure_unwinds_everything() {
        let (device, iommu) = backing();
        device.fail_iommu_map_after(3);

        assert!(matches!(
            iommu.allocate(0x8000, 0x1000),
            Err(InstmemError::PlatformAllocationFailed(_))
        ));
        assert_eq!(device.iommu_domain().unwrap().mapped_pages(), 0);
        assert_eq!(device.system_memory().live_pages(), 0);
        assert!(iommu.space().is_idle());

        device.clear_faults();
        let node = iommu.allocate(0x8000, 0x1000).unwrap();
        iommu.free(&node);
    }

    #[test]
    fn exhausted_space_frees_pages() {
        let device = SimDevice::new(SimConfig::system_memory(0xea).with_iommu(0x4000)).unwrap();
        let pramin = Arc::new(Pramin::new(device.registers()));
        let iommu = IommuBacking::new(device.iommu().unwrap(), device.page_allocator(), pramin);
        let held = iommu.space().reserve(0x2000, 0).unwrap();

        assert!(matches!(
            iommu.allocate(0x4000, 0x1000),
            Err(InstmemError::OutOfAddressSpace { .. })
        ));
        assert_eq!(device.system_memory().live_pages(), 0);
        iommu.space().release(held);
    }

    #[test]
    fn request_larger_than_the_space_takes_no_pages() {
        let (device, iommu) = backing();
        device.fail_page_alloc_after(0);

        assert_eq!(
            iommu.allocate(1 << 60, 0x1000).unwrap_err(),
            InstmemError::OutOfAddressSpace {
                size: 1 << 60,
                align: 0x1000
            }
        );
        assert_eq!(device.system_memory().live_pages(), 0);
        assert!(iommu.space().is_idle());
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Unmap { range_held: bool },
        FreePage { range_held: bool },
    }

    type EventLog = Arc<Mutex<Vec<Event>>>;

    struct RecordingDomain {
        space: Arc<RangeAllocator>,
        log: EventLog,
        maps_left: AtomicU32,
    }

    impl IommuDomain for RecordingDomain {
        fn map(&self, _iova: u64, _phys: u64, _size: u64, _prot: IommuProt) -> Result<(), i32> {
            self.maps_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map(|_| ())
                .map_err(|_| -12)
        }

        fn unmap(&self, _iova: u64, size: u64) -> u64 {
            let range_held = !self.space.is_idle();
            self.log.lock().unwrap().push(Event::Unmap { range_held });
            size
        }
    }

    struct RecordingPages {
        space: Arc<RangeAllocator>,
        log: EventLog,
        next: AtomicU64,
    }

    impl PageAllocator for RecordingPages {
        fn alloc_page(&self) -> Option<PhysPage> {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            Some(PhysPage(0x1000_0000 + n * PAGE_SIZE))
        }

        fn free_page(&self, _page: PhysPage) {
            let range_held = !self.space.is_idle();
            self.log.lock().unwrap().push(Event::FreePage { range_held });
        }
    }

    #[test]
    fn map_failure_unmaps_then_releases_range_then_frees_pages() {
        let device = SimDevice::new(SimConfig::system_memory(0xea)).unwrap();
        let space = Arc::new(RangeAllocator::new("iommu", 0, 1 << 24, PAGE_SIZE).unwrap());
        let log = EventLog::default();
        let domain = Arc::new(RecordingDomain {
            space: space.clone(),
            log: log.clone(),
            maps_left: 3.into(),
        });
        let pages = Arc::new(RecordingPages {
            space: space.clone(),
            log: log.clone(),
            next: 0.into(),
        });
        let pramin = Arc::new(Pramin::new(device.registers()));
        let iommu = IommuBacking::new(
            IommuContext {
                domain,
                space: space.clone(),
            },
            pages,
            pramin,
        );

        assert!(matches!(
            iommu.allocate(0x8000, 0x1000),
            Err(InstmemError::PlatformAllocationFailed(_))
        ));

        let events = log.lock().unwrap().clone();
        let unmaps = vec![Event::Unmap { range_held: true }; 3];
        let frees = vec![Event::FreePage { range_held: false }; 8];
        assert_eq!(events[..3], unmaps[..]);
        assert_eq!(events[3..], frees[..]);
        assert!(space.is_idle());
    }
}
