use super::dma::DmaBacking;
use super::heap::HeapBacking;
use super::iommu::IommuBacking;
use super::layout::{self, ReservedLayout};
use super::pramin::Pramin;
use super::{Backing, InstFlags, InstanceObject, Strategy};
use crate::device::regs::{PRAMIN_BAR_FALLBACK, PRAMIN_BAR_PRIMARY};
use crate::device::{ChipsetInfo, DeviceFamily, Platform};
use crate::error::{InstmemError, InstmemResult};
use crate::mm::RangeAllocator;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ===============================================================================================
// State
// ===============================================================================================

/// Runtime state of a controller. Destruction consumes the [`Instmem`], so there
/// is no destroyed state to observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstmemState {
    Constructed,
    Initialized,
    Suspended,
}

impl InstmemState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Constructed => "constructed",
            Self::Initialized => "initialized",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for InstmemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Firmware structures placed at the bottom of the reserved VRAM heap.
#[derive(Debug)]
pub struct FixedObjects {
    pub vbios: InstanceObject,
    pub ramht: InstanceObject,
    pub ramro: InstanceObject,
    pub ramfc: InstanceObject,
}

// ===============================================================================================
// Controller
// ===============================================================================================

/// The instance memory subdevice of one GPU.
///
/// Picks a backing when constructed and hands out [`InstanceObject`]s from it.
/// Safe to share between threads.
pub struct Instmem {
    chipset: ChipsetInfo,
    backing: Arc<Backing>,
    pramin: Arc<Pramin>,
    layout: Option<ReservedLayout>,
    fixed: Option<FixedObjects>,
    /// Read-held for the whole of an allocation, write-held by transitions.
    state: RwLock<InstmemState>,
}

impl Instmem {
    /// Sets up instance memory for `platform`.
    ///
    /// Devices with dedicated VRAM get a reserved heap at the start of VRAM with the
    /// firmware structures allocated inside it. Otherwise objects come from system
    /// memory, through the IOMMU when the device has a domain and from the DMA
    /// allocator when it does not.
    ///
    /// # Errors
    ///
    /// - `UnsupportedPlatform` if the chipset family is not handled, or a VRAM
    ///   device is not Curie-class or its BAR cannot hold the reserved heap.
    /// - `PlatformAllocationFailed` if the PRAMIN BAR cannot be mapped.
    /// - Any allocation error raised while placing the firmware structures.
    pub fn new(platform: &dyn Platform) -> InstmemResult<Self> {
        let chipset = platform.chipset();
        if !chipset.family.is_supported() {
            return Err(InstmemError::UnsupportedPlatform(format!(
                "chipset 0x{:x} ({}) has no instmem support",
                chipset.chipset, chipset.family
            )));
        }

        let pramin = Arc::new(Pramin::new(platform.registers()));

        let (backing, layout) = if chipset.has_vram {
            let (heap, layout) = Self::heap_backing(platform, &chipset)?;
            (Backing::Heap(heap), Some(layout))
        } else if let Some(ctx) = platform.iommu() {
            info!("using IOMMU");
            let iommu = IommuBacking::new(ctx, platform.page_allocator(), pramin.clone());
            (Backing::Iommu(iommu), None)
        } else {
            info!("using DMA API");
            let dma = DmaBacking::new(platform.dma_allocator(), pramin.clone());
            (Backing::Dma(dma), None)
        };

        let mut imem = Self {
            chipset,
            backing: Arc::new(backing),
            pramin,
            layout,
            fixed: None,
            state: RwLock::new(InstmemState::Constructed),
        };

        if let Some(layout) = layout {
            imem.fixed = Some(imem.alloc_fixed(&layout)?);
        }

        Ok(imem)
    }

    fn heap_backing(
        platform: &dyn Platform,
        chipset: &ChipsetInfo,
    ) -> InstmemResult<(HeapBacking, ReservedLayout)> {
        if chipset.family != DeviceFamily::Curie {
            return Err(InstmemError::UnsupportedPlatform(format!(
                "no reserved heap sizing for {} chipset 0x{:x}",
                chipset.family, chipset.chipset
            )));
        }

        let bar = if platform.resource_len(PRAMIN_BAR_PRIMARY) != 0 {
            PRAMIN_BAR_PRIMARY
        } else {
            PRAMIN_BAR_FALLBACK
        };
        let Some(iomem) = platform.map_resource(bar) else {
            error!("unable to map PRAMIN BAR");
            return Err(InstmemError::PlatformAllocationFailed(format!(
                "unable to map PRAMIN BAR {bar}"
            )));
        };

        let regs = platform.registers();
        let vs = layout::shader_units(&*regs);
        let layout = ReservedLayout::compute(chipset.chipset, vs);
        if layout.reserved > iomem.len() {
            return Err(InstmemError::UnsupportedPlatform(format!(
                "PRAMIN BAR {bar} (0x{:x} bytes) cannot hold 0x{:x} reserved bytes",
                iomem.len(),
                layout.reserved
            )));
        }

        info!(
            "using VRAM heap: 0x{:x} reserved bytes, {vs} shader units",
            layout.reserved
        );
        Ok((HeapBacking::new(layout.reserved, iomem)?, layout))
    }

    /// Places the firmware structures; on failure the ones already placed are
    /// released as they drop.
    fn alloc_fixed(&self, layout: &ReservedLayout) -> InstmemResult<FixedObjects> {
        let vbios = self.allocate(layout.vbios.length, 0, InstFlags::empty())?;
        let ramht = self.allocate(layout.ramht.length, 0, InstFlags::empty())?;
        let ramro = self.allocate(layout.ramro.length, 0, InstFlags::empty())?;
        let ramfc = self.allocate(layout.ramfc.length, 0, InstFlags::ZERO)?;

        debug_assert_eq!(vbios.offset(), layout.vbios.base);
        debug_assert_eq!(ramht.offset(), layout.ramht.base);
        debug_assert_eq!(ramro.offset(), layout.ramro.base);
        debug_assert_eq!(ramfc.offset(), layout.ramfc.base);

        Ok(FixedObjects {
            vbios,
            ramht,
            ramro,
            ramfc,
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, InstmemState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, InstmemState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        &self,
        op: &'static str,
        from: InstmemState,
        to: InstmemState,
    ) -> InstmemResult<()> {
        let mut state = self.write_state();
        if *state != from {
            return Err(InstmemError::InvalidState {
                op,
                state: state.as_str(),
            });
        }
        *state = to;
        Ok(())
    }

    // ===========================================================================================
    // Lifecycle
    // ===========================================================================================

    /// # Errors
    ///
    /// Returns `InvalidState` unless freshly constructed.
    pub fn init(&self) -> InstmemResult<()> {
        self.transition("init", InstmemState::Constructed, InstmemState::Initialized)?;
        debug!("instmem initialized ({})", self.strategy());
        Ok(())
    }

    /// Forgets the PRAMIN window, which the hardware will not preserve. Object
    /// mappings stay in place. Waits for allocations already in progress.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless initialized, `Busy` if a windowed access is
    /// in flight.
    pub fn suspend(&self) -> InstmemResult<()> {
        let mut state = self.write_state();
        if *state != InstmemState::Initialized {
            return Err(InstmemError::InvalidState {
                op: "suspend",
                state: state.as_str(),
            });
        }
        if !self.pramin.try_invalidate() {
            return Err(InstmemError::Busy);
        }
        *state = InstmemState::Suspended;
        debug!("instmem suspended");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidState` unless suspended.
    pub fn resume(&self) -> InstmemResult<()> {
        self.transition("resume", InstmemState::Suspended, InstmemState::Initialized)?;
        debug!("instmem resumed");
        Ok(())
    }

    /// Frees the firmware structures and releases the backing. Objects still held
    /// by callers keep their memory until they are dropped.
    pub fn destroy(self) {
        drop(self);
    }

    // ===========================================================================================
    // Instance Objects
    // ===========================================================================================

    /// Allocates an instance object of at least `size` bytes aligned to at least
    /// `align`. Both are rounded up to the page size.
    ///
    /// # Errors
    ///
    /// - `InvalidState` when suspended.
    /// - `InvalidArgument` if `align` is not a power of two.
    /// - `OutOfAddressSpace`, `OutOfMemory` or `PlatformAllocationFailed` from the
    ///   backing; nothing stays allocated in that case.
    pub fn allocate(&self, size: u64, align: u64, flags: InstFlags) -> InstmemResult<InstanceObject> {
        // Held until the object is filled so no transition lands mid-allocation.
        let state = self.read_state();
        if !matches!(
            *state,
            InstmemState::Constructed | InstmemState::Initialized
        ) {
            return Err(InstmemError::InvalidState {
                op: "allocate",
                state: state.as_str(),
            });
        }

        let obj = InstanceObject::new(self.backing.clone(), size, align)?;
        if flags.contains(InstFlags::ZERO) {
            obj.fill(0);
        }
        drop(state);
        Ok(obj)
    }

    /// # Errors
    ///
    /// See [`allocate`](Self::allocate).
    pub fn allocate_instance_object(&self, size: u64, align: u64) -> InstmemResult<InstanceObject> {
        self.allocate(size, align, InstFlags::empty())
    }

    pub fn free_instance_object(&self, obj: InstanceObject) {
        drop(obj);
    }

    #[must_use]
    pub fn read32(&self, obj: &InstanceObject, offset: u64) -> u32 {
        obj.rd32(offset)
    }

    pub fn write32(&self, obj: &InstanceObject, offset: u64, data: u32) {
        obj.wr32(offset, data);
    }

    // ===========================================================================================
    // Introspection
    // ===========================================================================================

    #[must_use]
    pub const fn chipset(&self) -> &ChipsetInfo {
        &self.chipset
    }

    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.backing.strategy()
    }

    #[must_use]
    pub fn state(&self) -> InstmemState {
        *self.read_state()
    }

    /// `None` unless backed by the VRAM heap.
    #[must_use]
    pub const fn reserved_layout(&self) -> Option<&ReservedLayout> {
        self.layout.as_ref()
    }

    #[must_use]
    pub const fn fixed_objects(&self) -> Option<&FixedObjects> {
        self.fixed.as_ref()
    }

    /// Objects currently allocated, the firmware structures included.
    #[must_use]
    pub fn live_objects(&self) -> usize {
        Arc::strong_count(&self.backing) - 1
    }

    /// The allocator objects are placed by: the VRAM heap or the IOMMU space.
    #[must_use]
    pub fn address_space(&self) -> Option<&RangeAllocator> {
        match &*self.backing {
            Backing::Heap(heap) => Some(heap.heap()),
            Backing::Iommu(iommu) => Some(iommu.space()),
            Backing::Dma(_) => None,
        }
    }

    #[must_use]
    pub fn pramin(&self) -> &Pramin {
        &self.pramin
    }
}

impl Drop for Instmem {
    fn drop(&mut self) {
        if let Some(fixed) = self.fixed.take() {
            let FixedObjects {
                vbios,
                ramht,
                ramro,
                ramfc,
            } = fixed;
            drop(ramfc);
            drop(ramro);
            drop(ramht);
            drop(vbios);
        }

        let leaked = self.live_objects();
        if leaked > 0 {
            warn!(
                "{leaked} instance object(s) still alive at teardown, {} backing kept until they drop",
                self.strategy()
            );
        }
        debug!("instmem destroyed");
    }
}

impl fmt::Debug for Instmem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instmem")
            .field("chipset", &format_args!("0x{:x}", self.chipset.chipset))
            .field("strategy", &self.strategy())
            .field("state", &self.state())
            .field("live_objects", &self.live_objects())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SimConfig, SimDevice};
    use std::thread;
    use std::time::Duration;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn suspend_is_busy_while_window_is_held() {
        init_logger();
        let device = SimDevice::new(SimConfig::system_memory(0xea)).unwrap();
        let imem = Instmem::new(&device).unwrap();
        imem.init().unwrap();

        let guard = imem.pramin.lock_window();
        assert_eq!(imem.suspend(), Err(InstmemError::Busy));
        assert_eq!(imem.state(), InstmemState::Initialized);
        drop(guard);

        imem.suspend().unwrap();
        assert_eq!(imem.state(), InstmemState::Suspended);
    }

    #[test]
    fn suspend_waits_for_in_flight_allocation() {
        init_logger();
        let device = SimDevice::new(SimConfig::system_memory(0xea)).unwrap();
        let imem = Instmem::new(&device).unwrap();
        imem.init().unwrap();

        // Stands in for an allocation between its state check and its fill.
        let allocating = imem.read_state();
        thread::scope(|s| {
            let suspend = s.spawn(|| imem.suspend());
            thread::sleep(Duration::from_millis(50));
            assert!(!suspend.is_finished());
            assert_eq!(*allocating, InstmemState::Initialized);

            drop(allocating);
            assert_eq!(suspend.join().unwrap(), Ok(()));
        });
        assert_eq!(imem.state(), InstmemState::Suspended);
        assert!(matches!(
            imem.allocate_instance_object(0x1000, 0),
            Err(InstmemError::InvalidState { .. })
        ));
    }

    #[test]
    fn fixed_objects_count_as_live() {
        init_logger();
        let device = SimDevice::new(SimConfig::dedicated_vram(0x47)).unwrap();
        let imem = Instmem::new(&device).unwrap();

        assert_eq!(imem.live_objects(), 4);
        let obj = imem.allocate_instance_object(0x1000, 0).unwrap();
        assert_eq!(imem.live_objects(), 5);
        imem.free_instance_object(obj);
        assert_eq!(imem.live_objects(), 4);
    }
}
