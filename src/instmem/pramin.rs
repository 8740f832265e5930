use crate::device::RegisterIo;
use crate::device::regs::{
    NV_PBUS_BAR0_WINDOW, NV_PBUS_BAR0_WINDOW_SHIFT, NV_PRAMIN, PRAMIN_OFFSET_MASK,
    PRAMIN_WINDOW_MASK,
};
use log::trace;
use spin::Mutex;
use std::fmt;
use std::sync::Arc;

/// Windowed access to GPU-visible memory through the 1 MiB PRAMIN aperture.
///
/// The window register is only rewritten when an access falls outside the window
/// currently selected. The cached base and every access through it are guarded by
/// one spinlock, so the compare, the reprogram and the access are atomic with
/// respect to other users of the window.
pub struct Pramin {
    regs: Arc<dyn RegisterIo>,
    /// `None` means the hardware window is unknown and must be reprogrammed.
    window: Mutex<Option<u64>>,
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn split(addr: u64) -> (u64, u32) {
    (addr & PRAMIN_WINDOW_MASK, (addr & PRAMIN_OFFSET_MASK) as u32)
}

impl Pramin {
    #[must_use]
    pub fn new(regs: Arc<dyn RegisterIo>) -> Self {
        Self {
            regs,
            window: Mutex::new(None),
        }
    }

    /// Points the window at `base`. Returns whether the register was written.
    #[allow(clippy::cast_possible_truncation)]
    fn select(&self, window: &mut Option<u64>, base: u64) -> bool {
        if *window == Some(base) {
            return false;
        }
        self.regs
            .wr32(NV_PBUS_BAR0_WINDOW, (base >> NV_PBUS_BAR0_WINDOW_SHIFT) as u32);
        *window = Some(base);
        true
    }

    /// Reads the word at GPU address `addr`.
    #[must_use]
    pub fn rd32(&self, addr: u64) -> u32 {
        let (base, offset) = split(addr);
        let (data, moved) = {
            let mut window = self.window.lock();
            let moved = self.select(&mut window, base);
            (self.regs.rd32(NV_PRAMIN + offset), moved)
        };
        if moved {
            trace!("PRAMIN window moved to 0x{base:x}");
        }
        data
    }

    /// Writes the word at GPU address `addr`.
    pub fn wr32(&self, addr: u64, data: u32) {
        let (base, offset) = split(addr);
        let moved = {
            let mut window = self.window.lock();
            let moved = self.select(&mut window, base);
            self.regs.wr32(NV_PRAMIN + offset, data);
            moved
        };
        if moved {
            trace!("PRAMIN window moved to 0x{base:x}");
        }
    }

    /// Forgets the cached window so the next access reprograms it.
    pub fn invalidate(&self) {
        *self.window.lock() = None;
    }

    /// Like [`invalidate`](Self::invalidate), but fails instead of spinning when
    /// an access is in flight.
    #[must_use]
    pub fn try_invalidate(&self) -> bool {
        match self.window.try_lock() {
            Some(mut window) => {
                *window = None;
                true
            }
            None => false,
        }
    }

    /// The window base last programmed, if still trusted.
    #[must_use]
    pub fn current_window(&self) -> Option<u64> {
        *self.window.lock()
    }

    /// Holds the window as an in-flight access would.
    #[cfg(test)]
    pub(crate) fn lock_window(&self) -> spin::MutexGuard<'_, Option<u64>> {
        self.window.lock()
    }
}

impl fmt::Debug for Pramin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pramin")
            .field("window", &self.current_window())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingRegs {
        writes: StdMutex<Vec<(u32, u32)>>,
        values: StdMutex<HashMap<u32, u32>>,
    }

    impl RecordingRegs {
        fn window_writes(&self) -> Vec<u32> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .filter(|(addr, _)| *addr == NV_PBUS_BAR0_WINDOW)
                .map(|&(_, data)| data)
                .collect()
        }
    }

    impl RegisterIo for RecordingRegs {
        fn rd32(&self, addr: u32) -> u32 {
            self.values.lock().unwrap().get(&addr).copied().unwrap_or(0)
        }

        fn wr32(&self, addr: u32, data: u32) {
            self.writes.lock().unwrap().push((addr, data));
            self.values.lock().unwrap().insert(addr, data);
        }
    }

    fn pramin() -> (Arc<RecordingRegs>, Pramin) {
        let regs = Arc::new(RecordingRegs::default());
        let pramin = Pramin::new(regs.clone());
        (regs, pramin)
    }

    #[test]
    fn accesses_in_same_window_program_once() {
        let (regs, pramin) = pramin();

        pramin.wr32(0x4_0010_0000, 0xdead_beef);
        pramin.wr32(0x4_0010_0004, 0x1234_5678);
        let _ = pramin.rd32(0x4_001f_fffc);

        assert_eq!(regs.window_writes(), vec![0x4_0010]);
        assert_eq!(pramin.current_window(), Some(0x4_0010_0000));
    }

    #[test]
    fn access_lands_at_window_offset() {
        let (regs, pramin) = pramin();

        pramin.wr32(0x20_0040, 7);

        let writes = regs.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![(NV_PBUS_BAR0_WINDOW, 0x20), (NV_PRAMIN + 0x40, 7)]);
    }

    #[test]
    fn crossing_a_window_boundary_reprograms() {
        let (regs, pramin) = pramin();

        let _ = pramin.rd32(0x00ff_fffc);
        let _ = pramin.rd32(0x0100_0000);
        let _ = pramin.rd32(0x0100_0004);

        assert_eq!(regs.window_writes(), vec![0xf0, 0x100]);
    }

    #[test]
    fn invalidate_forces_reprogram() {
        let (regs, pramin) = pramin();

        let _ = pramin.rd32(0x10_0000);
        pramin.invalidate();
        assert_eq!(pramin.current_window(), None);
        let _ = pramin.rd32(0x10_0000);

        assert_eq!(regs.window_writes(), vec![0x10, 0x10]);
    }

    #[test]
    fn try_invalidate_fails_while_locked() {
        let (_regs, pramin) = pramin();

        let guard = pramin.window.lock();
        assert!(!pramin.try_invalidate());
        drop(guard);
        assert!(pramin.try_invalidate());
    }
}
