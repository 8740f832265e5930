//! A simulated device implementing [`Platform`].
//!
//! The simulator models just enough hardware for the instmem core to run end to
//! end on a host: a BAR0 register file whose PRAMIN aperture resolves through the
//! programmed window, a VRAM BAR, system memory backed by an anonymous host
//! mapping, and an optional IOMMU domain. Fault injection hooks let callers make
//! page, DMA, IOMMU map and BAR map requests fail on demand.

#![allow(clippy::cast_possible_truncation)]

use super::regs::{
    IOMMU_ADDR_FLAG, NV_PBUS_BAR0_WINDOW, NV_PBUS_BAR0_WINDOW_SHIFT, NV_PGRAPH_UNIT_CONFIG,
    NV_PRAMIN, PAGE_SIZE, PRAMIN_BAR_FALLBACK, PRAMIN_BAR_PRIMARY, PRAMIN_WINDOW_SIZE,
    is_iommu_address, strip_iommu_bit,
};
use super::{
    ChipsetInfo, DmaAllocator, DmaAttrs, DmaBuffer, IoMem, IommuContext, IommuDomain, IommuProt,
    PageAllocator, PhysPage, Platform, RegisterIo,
};
use crate::mm::{AddressRange, RangeAllocator};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Physical address of the first byte of simulated system memory.
pub const SIM_SYSMEM_BASE: u64 = 0x1000_0000;

/// Value returned for reads that hit nothing, like a master abort on the bus.
const BUS_ERROR: u32 = 0xffff_ffff;

const NV_PRAMIN_END: u32 = NV_PRAMIN + PRAMIN_WINDOW_SIZE as u32;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumes one unit of an optional failure budget. Returns `false` once it is exhausted.
fn take_budget(budget: &Mutex<Option<usize>>) -> bool {
    let mut guard = lock(budget);
    match guard.as_mut() {
        Some(0) => false,
        Some(n) => {
            *n -= 1;
            true
        }
        None => true,
    }
}

// ===============================================================================================
// Configuration
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    pub chipset: u32,
    pub has_vram: bool,
    /// Value of `NV_PGRAPH_UNIT_CONFIG`.
    pub unit_config: u32,
    pub bar2_len: u64,
    pub bar3_len: u64,
    pub sysmem_size: u64,
    /// Size of the IOMMU virtual space. `None` means no domain was established.
    pub iommu_space: Option<u64>,
}

impl SimConfig {
    /// A discrete board with dedicated VRAM and all eight shader units enabled.
    #[must_use]
    pub const fn dedicated_vram(chipset: u32) -> Self {
        Self {
            chipset,
            has_vram: true,
            unit_config: 0x0000_ff00,
            bar2_len: 8 << 20,
            bar3_len: 0,
            sysmem_size: 4 << 20,
            iommu_space: None,
        }
    }

    /// An embedded part without VRAM, instance memory comes from system pages.
    #[must_use]
    pub const fn system_memory(chipset: u32) -> Self {
        Self {
            chipset,
            has_vram: false,
            unit_config: 0,
            bar2_len: 0,
            bar3_len: 0,
            sysmem_size: 32 << 20,
            iommu_space: None,
        }
    }

    #[must_use]
    pub const fn with_iommu(mut self, space: u64) -> Self {
        self.iommu_space = Some(space);
        self
    }

    #[must_use]
    pub const fn with_unit_config(mut self, value: u32) -> Self {
        self.unit_config = value;
        self
    }

    #[must_use]
    pub const fn with_bars(mut self, bar2_len: u64, bar3_len: u64) -> Self {
        self.bar2_len = bar2_len;
        self.bar3_len = bar3_len;
        self
    }

    #[must_use]
    pub const fn with_sysmem(mut self, size: u64) -> Self {
        self.sysmem_size = size;
        self
    }
}

// ===============================================================================================
// Host-backed System Memory
// ===============================================================================================

/// An anonymous private host mapping standing in for physical RAM.
#[derive(Debug)]
struct HostArena {
    ptr: NonNull<u8>,
    len: usize,
}

// The arena is plain memory; all accesses are single aligned volatile words.
unsafe impl Send for HostArena {}
unsafe impl Sync for HostArena {}

impl HostArena {
    fn new(len: usize) -> io::Result<Self> {
        let ret = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ret == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ret.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(Self { ptr, len })
    }

    fn word(&self, offset: u64) -> Option<*mut u32> {
        let offset = usize::try_from(offset).ok()?;
        if offset % 4 != 0 || offset.checked_add(4)? > self.len {
            return None;
        }
        // Safety: bounds and alignment checked above; the mapping is page aligned.
        #[allow(clippy::cast_ptr_alignment)]
        Some(unsafe { self.ptr.as_ptr().add(offset).cast::<u32>() })
    }

    fn rd32(&self, offset: u64) -> Option<u32> {
        self.word(offset)
            .map(|p| unsafe { ptr::read_volatile(p) })
    }

    fn wr32(&self, offset: u64, data: u32) -> bool {
        self.word(offset)
            .map(|p| unsafe { ptr::write_volatile(p, data) })
            .is_some()
    }
}

impl Drop for HostArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Simulated system RAM. Serves both single pages and contiguous DMA buffers.
#[derive(Debug)]
pub struct SimSystemMemory {
    arena: HostArena,
    mm: RangeAllocator,
    page_budget: Mutex<Option<usize>>,
    fail_dma: AtomicBool,
    live_pages: AtomicUsize,
    live_dma: AtomicUsize,
}

impl SimSystemMemory {
    fn new(size: u64) -> io::Result<Self> {
        let len = usize::try_from(size).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let arena = HostArena::new(len)?;
        let mm = RangeAllocator::new("sysmem", SIM_SYSMEM_BASE, size, PAGE_SIZE)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        Ok(Self {
            arena,
            mm,
            page_budget: Mutex::new(None),
            fail_dma: AtomicBool::new(false),
            live_pages: AtomicUsize::new(0),
            live_dma: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn rd32(&self, phys: u64) -> Option<u32> {
        self.arena.rd32(phys.checked_sub(SIM_SYSMEM_BASE)?)
    }

    pub fn wr32(&self, phys: u64, data: u32) -> bool {
        phys.checked_sub(SIM_SYSMEM_BASE)
            .is_some_and(|offset| self.arena.wr32(offset, data))
    }

    #[must_use]
    pub fn live_pages(&self) -> usize {
        self.live_pages.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_dma_buffers(&self) -> usize {
        self.live_dma.load(Ordering::SeqCst)
    }
}

impl PageAllocator for SimSystemMemory {
    fn alloc_page(&self) -> Option<PhysPage> {
        if !take_budget(&self.page_budget) {
            return None;
        }
        let range = self.mm.reserve(PAGE_SIZE, PAGE_SIZE).ok()?;
        self.live_pages.fetch_add(1, Ordering::SeqCst);
        Some(PhysPage(range.base))
    }

    fn free_page(&self, page: PhysPage) {
        self.mm.release(AddressRange::new(page.0, PAGE_SIZE));
        self.live_pages.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DmaAllocator for SimSystemMemory {
    fn alloc(&self, size: u64, _attrs: DmaAttrs) -> Option<DmaBuffer> {
        if self.fail_dma.load(Ordering::SeqCst) {
            return None;
        }
        let range = self.mm.reserve(size, PAGE_SIZE).ok()?;
        self.live_dma.fetch_add(1, Ordering::SeqCst);
        Some(DmaBuffer {
            handle: range.base,
            size: range.length,
        })
    }

    fn free(&self, buffer: DmaBuffer, _attrs: DmaAttrs) {
        self.mm
            .release(AddressRange::new(buffer.handle, buffer.size));
        self.live_dma.fetch_sub(1, Ordering::SeqCst);
    }
}

// ===============================================================================================
// IOMMU
// ===============================================================================================

/// Page-granular IOVA -> physical translation table.
#[derive(Debug, Default)]
pub struct SimIommu {
    mappings: Mutex<BTreeMap<u64, u64>>,
    map_budget: Mutex<Option<usize>>,
}

impl SimIommu {
    #[must_use]
    pub fn translate(&self, iova: u64) -> Option<u64> {
        let page = iova & !(PAGE_SIZE - 1);
        lock(&self.mappings)
            .get(&page)
            .map(|phys| phys + (iova & (PAGE_SIZE - 1)))
    }

    #[must_use]
    pub fn mapped_pages(&self) -> usize {
        lock(&self.mappings).len()
    }
}

impl IommuDomain for SimIommu {
    fn map(&self, iova: u64, phys: u64, size: u64, prot: IommuProt) -> Result<(), i32> {
        if size == 0 || size % PAGE_SIZE != 0 || iova % PAGE_SIZE != 0 || prot.is_empty() {
            return Err(-libc::EINVAL);
        }
        if !take_budget(&self.map_budget) {
            return Err(-libc::ENOMEM);
        }

        let mut mappings = lock(&self.mappings);
        let pages = size / PAGE_SIZE;
        if (0..pages).any(|i| mappings.contains_key(&(iova + i * PAGE_SIZE))) {
            return Err(-libc::EEXIST);
        }
        for i in 0..pages {
            mappings.insert(iova + i * PAGE_SIZE, phys + i * PAGE_SIZE);
        }
        Ok(())
    }

    fn unmap(&self, iova: u64, size: u64) -> u64 {
        let mut mappings = lock(&self.mappings);
        let mut unmapped = 0;
        let mut page = iova & !(PAGE_SIZE - 1);
        while page < iova + size {
            if mappings.remove(&page).is_some() {
                unmapped += PAGE_SIZE;
            }
            page += PAGE_SIZE;
        }
        unmapped
    }
}

// ===============================================================================================
// VRAM BAR
// ===============================================================================================

#[derive(Debug)]
pub struct SimVram {
    words: Vec<AtomicU32>,
}

impl SimVram {
    fn new(len: u64) -> Self {
        let words = (0..len / 4).map(|_| AtomicU32::new(0)).collect();
        Self { words }
    }

    fn word(&self, offset: u64) -> Option<&AtomicU32> {
        if offset % 4 != 0 {
            return None;
        }
        self.words.get(usize::try_from(offset / 4).ok()?)
    }
}

impl IoMem for SimVram {
    fn rd32(&self, offset: u64) -> u32 {
        self.word(offset)
            .map_or(BUS_ERROR, |w| w.load(Ordering::SeqCst))
    }

    fn wr32(&self, offset: u64, data: u32) {
        if let Some(w) = self.word(offset) {
            w.store(data, Ordering::SeqCst);
        }
    }

    fn len(&self) -> u64 {
        self.words.len() as u64 * 4
    }
}

// ===============================================================================================
// BAR0 Register File
// ===============================================================================================

/// Where PRAMIN accesses land.
#[derive(Debug)]
enum PraminTarget {
    Vram(Arc<SimVram>),
    System {
        memory: Arc<SimSystemMemory>,
        iommu: Option<Arc<SimIommu>>,
    },
}

impl PraminTarget {
    fn resolve(&self, addr: u64) -> Option<u64> {
        match self {
            Self::Vram(_) => Some(addr),
            Self::System { iommu, .. } if is_iommu_address(addr) => {
                iommu.as_ref()?.translate(strip_iommu_bit(addr))
            }
            Self::System { .. } => Some(addr),
        }
    }

    fn rd32(&self, addr: u64) -> u32 {
        let Some(target) = self.resolve(addr) else {
            return BUS_ERROR;
        };
        match self {
            Self::Vram(vram) => vram.rd32(target),
            Self::System { memory, .. } => memory.rd32(target).unwrap_or(BUS_ERROR),
        }
    }

    fn wr32(&self, addr: u64, data: u32) {
        let Some(target) = self.resolve(addr) else {
            return;
        };
        match self {
            Self::Vram(vram) => vram.wr32(target, data),
            Self::System { memory, .. } => {
                memory.wr32(target, data);
            }
        }
    }
}

#[derive(Debug)]
pub struct SimRegisters {
    unit_config: u32,
    window: AtomicU32,
    window_writes: AtomicUsize,
    scratch: Mutex<HashMap<u32, u32>>,
    target: PraminTarget,
}

impl SimRegisters {
    fn pramin_addr(&self, addr: u32) -> u64 {
        let base = u64::from(self.window.load(Ordering::SeqCst)) << NV_PBUS_BAR0_WINDOW_SHIFT;
        base + u64::from(addr - NV_PRAMIN)
    }
}

impl RegisterIo for SimRegisters {
    fn rd32(&self, addr: u32) -> u32 {
        match addr {
            NV_PGRAPH_UNIT_CONFIG => self.unit_config,
            NV_PBUS_BAR0_WINDOW => self.window.load(Ordering::SeqCst),
            NV_PRAMIN..NV_PRAMIN_END => self.target.rd32(self.pramin_addr(addr)),
            _ => lock(&self.scratch).get(&addr).copied().unwrap_or(0),
        }
    }

    fn wr32(&self, addr: u32, data: u32) {
        match addr {
            NV_PBUS_BAR0_WINDOW => {
                self.window.store(data, Ordering::SeqCst);
                self.window_writes.fetch_add(1, Ordering::SeqCst);
            }
            NV_PRAMIN..NV_PRAMIN_END => self.target.wr32(self.pramin_addr(addr), data),
            _ => {
                lock(&self.scratch).insert(addr, data);
            }
        }
    }
}

// ===============================================================================================
// Device
// ===============================================================================================

#[derive(Debug)]
struct SimIommuParts {
    domain: Arc<SimIommu>,
    space: Arc<RangeAllocator>,
}

/// A simulated GPU. Cheap to query; share it by reference.
#[derive(Debug)]
pub struct SimDevice {
    config: SimConfig,
    regs: Arc<SimRegisters>,
    vram: Arc<SimVram>,
    memory: Arc<SimSystemMemory>,
    iommu: Option<SimIommuParts>,
    fail_bar_map: AtomicBool,
}

impl SimDevice {
    /// Builds the simulated device described by `config`.
    ///
    /// # Errors
    /// Returns an error if the host mapping for system memory cannot be created
    /// or if the configured address spaces are invalid.
    pub fn new(config: SimConfig) -> io::Result<Self> {
        let memory = Arc::new(SimSystemMemory::new(config.sysmem_size)?);
        let vram = Arc::new(SimVram::new(config.bar2_len.max(config.bar3_len)));

        let iommu = match config.iommu_space {
            Some(size) if size > IOMMU_ADDR_FLAG => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "IOMMU space overlaps the IOMMU resolve bit",
                ));
            }
            Some(size) => {
                let space = RangeAllocator::new("iommu", 0, size, PAGE_SIZE)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                Some(SimIommuParts {
                    domain: Arc::new(SimIommu::default()),
                    space: Arc::new(space),
                })
            }
            None => None,
        };

        let target = if config.has_vram {
            PraminTarget::Vram(vram.clone())
        } else {
            PraminTarget::System {
                memory: memory.clone(),
                iommu: iommu.as_ref().map(|parts| parts.domain.clone()),
            }
        };

        let regs = Arc::new(SimRegisters {
            unit_config: config.unit_config,
            window: AtomicU32::new(0),
            window_writes: AtomicUsize::new(0),
            scratch: Mutex::new(HashMap::new()),
            target,
        });

        Ok(Self {
            config,
            regs,
            vram,
            memory,
            iommu,
            fail_bar_map: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Number of writes to the PRAMIN window select register so far.
    #[must_use]
    pub fn window_writes(&self) -> usize {
        self.regs.window_writes.load(Ordering::SeqCst)
    }

    /// Currently programmed PRAMIN window base.
    #[must_use]
    pub fn window_base(&self) -> u64 {
        u64::from(self.regs.window.load(Ordering::SeqCst)) << NV_PBUS_BAR0_WINDOW_SHIFT
    }

    #[must_use]
    pub fn system_memory(&self) -> &SimSystemMemory {
        &self.memory
    }

    #[must_use]
    pub fn vram(&self) -> &SimVram {
        &self.vram
    }

    #[must_use]
    pub fn iommu_domain(&self) -> Option<&SimIommu> {
        self.iommu.as_ref().map(|parts| &*parts.domain)
    }

    #[must_use]
    pub fn iommu_space(&self) -> Option<&RangeAllocator> {
        self.iommu.as_ref().map(|parts| &*parts.space)
    }

    /// Reads a word of instance memory the way the GPU would see it, bypassing PRAMIN.
    #[must_use]
    pub fn gpu_rd32(&self, addr: u64) -> u32 {
        self.regs.target.rd32(addr)
    }

    // ===========================================================================================
    // Fault Injection
    // ===========================================================================================

    /// Lets the next `n` page allocations succeed, then fails every one after.
    pub fn fail_page_alloc_after(&self, n: usize) {
        *lock(&self.memory.page_budget) = Some(n);
    }

    /// Lets the next `n` IOMMU map calls succeed, then fails every one after.
    pub fn fail_iommu_map_after(&self, n: usize) {
        if let Some(parts) = &self.iommu {
            *lock(&parts.domain.map_budget) = Some(n);
        }
    }

    pub fn fail_dma_alloc(&self, fail: bool) {
        self.memory.fail_dma.store(fail, Ordering::SeqCst);
    }

    pub fn fail_bar_map(&self, fail: bool) {
        self.fail_bar_map.store(fail, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        *lock(&self.memory.page_budget) = None;
        if let Some(parts) = &self.iommu {
            *lock(&parts.domain.map_budget) = None;
        }
        self.fail_dma_alloc(false);
        self.fail_bar_map(false);
    }
}

impl Platform for SimDevice {
    fn chipset(&self) -> ChipsetInfo {
        ChipsetInfo::new(self.config.chipset, self.config.has_vram)
    }

    fn registers(&self) -> Arc<dyn RegisterIo> {
        self.regs.clone()
    }

    fn resource_len(&self, bar: u8) -> u64 {
        match bar {
            PRAMIN_BAR_PRIMARY => self.config.bar2_len,
            PRAMIN_BAR_FALLBACK => self.config.bar3_len,
            _ => 0,
        }
    }

    fn map_resource(&self, bar: u8) -> Option<Arc<dyn IoMem>> {
        if self.fail_bar_map.load(Ordering::SeqCst) || self.resource_len(bar) == 0 {
            return None;
        }
        let bar: Arc<dyn IoMem> = self.vram.clone();
        Some(bar)
    }

    fn iommu(&self) -> Option<IommuContext> {
        self.iommu.as_ref().map(|parts| IommuContext {
            domain: parts.domain.clone(),
            space: parts.space.clone(),
        })
    }

    fn page_allocator(&self) -> Arc<dyn PageAllocator> {
        self.memory.clone()
    }

    fn dma_allocator(&self) -> Arc<dyn DmaAllocator> {
        self.memory.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pramin_window_resolves_system_memory() {
        let sim = SimDevice::new(SimConfig::system_memory(0xea)).unwrap();
        let regs = sim.registers();

        let phys = SIM_SYSMEM_BASE + 0x12_3450;
        regs.wr32(NV_PBUS_BAR0_WINDOW, (phys >> 16) as u32 & !0xf);
        regs.wr32(NV_PRAMIN + 0x2_3450, 0xcafe_f00d);

        assert_eq!(sim.system_memory().rd32(phys), Some(0xcafe_f00d));
        assert_eq!(sim.window_writes(), 1);
    }

    #[test]
    fn iommu_translation() {
        let sim = SimDevice::new(SimConfig::system_memory(0xea).with_iommu(1 << 24)).unwrap();
        let iommu = sim.iommu_domain().unwrap();
        iommu
            .map(0x4000, SIM_SYSMEM_BASE, PAGE_SIZE, IommuProt::READ | IommuProt::WRITE)
            .unwrap();

        assert_eq!(iommu.translate(0x4010), Some(SIM_SYSMEM_BASE + 0x10));
        assert_eq!(iommu.translate(0x5000), None);
        assert_eq!(
            iommu.map(0x4000, SIM_SYSMEM_BASE, PAGE_SIZE, IommuProt::READ),
            Err(-libc::EEXIST)
        );
        assert_eq!(iommu.unmap(0x4000, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(iommu.mapped_pages(), 0);
    }

    #[test]
    fn page_budget_fails_after_n() {
        let sim = SimDevice::new(SimConfig::system_memory(0xea)).unwrap();
        let pages = sim.page_allocator();
        sim.fail_page_alloc_after(2);

        let a = pages.alloc_page().unwrap();
        let b = pages.alloc_page().unwrap();
        assert!(pages.alloc_page().is_none());
        pages.free_page(a);
        pages.free_page(b);

        sim.clear_faults();
        assert!(pages.alloc_page().is_some());
        assert_eq!(sim.system_memory().live_pages(), 1);
    }

    #[test]
    fn unmapped_reads_return_bus_error() {
        let sim = SimDevice::new(SimConfig::system_memory(0xea).with_iommu(1 << 24)).unwrap();
        assert_eq!(sim.gpu_rd32(IOMMU_ADDR_FLAG | 0x1000), BUS_ERROR);
        assert_eq!(sim.gpu_rd32(0x10), BUS_ERROR);
    }
}
