//! The peripheral bus.
//!
//! The processor sees its peripherals through a handful of
//! memory-mapped register pages; `MemoryUnit` decodes the page
//! number and routes the access here.  Devices implement the
//! [`BusDevice`] capability set (poll, read register, write
//! register) and raise interrupts through the controller they are
//! handed; tests can substitute doubles behind the same interface.

use tracing::{event, Level};

use crate::interrupt::InterruptController;
use crate::memory::PhysicalMemory;

pub(crate) mod disk;
pub(crate) mod iob;
pub(crate) mod tv;

pub use disk::{DiskController, DiskError, DiskGeometry, DiskImage};
pub use iob::IobDevice;
pub use tv::TvController;

/// The capability set a bus peripheral exposes.  Register offsets
/// are in the device's own register space; the memory unit has
/// already decoded which device a virtual address belongs to.
pub trait BusDevice {
    /// Called from the run loop; the device may raise interrupts or
    /// complete a previously started command.
    fn poll(&mut self, phys: &mut PhysicalMemory, irq: &mut InterruptController);

    fn read_register(&mut self, offset: u32, irq: &mut InterruptController) -> u32;

    fn write_register(
        &mut self,
        offset: u32,
        v: u32,
        phys: &mut PhysicalMemory,
        irq: &mut InterruptController,
    );
}

/// How often (in cycles) the slow devices are polled.
const COARSE_POLL_INTERVAL: u64 = 0x10000;

/// All peripherals, plus the unibus control page.
pub struct DeviceBus {
    pub tv: TvController,
    pub disk: DiskController,
    pub iob: IobDevice,
    prom_disable_pending: bool,
}

impl Default for DeviceBus {
    fn default() -> DeviceBus {
        DeviceBus::new()
    }
}

impl DeviceBus {
    pub fn new() -> DeviceBus {
        DeviceBus {
            tv: TvController::new(),
            disk: DiskController::new(),
            iob: IobDevice::new(),
            prom_disable_pending: false,
        }
    }

    /// Per-cycle device polling.  The display only needs coarse
    /// attention; the disk and IOB are polled every cycle so that
    /// delayed completion interrupts land on time.
    pub fn poll(
        &mut self,
        cycles: u64,
        phys: &mut PhysicalMemory,
        irq: &mut InterruptController,
    ) {
        self.iob.poll(phys, irq);
        self.disk.poll(phys, irq);
        if cycles & (COARSE_POLL_INTERVAL - 1) == 0 {
            self.tv.poll(phys, irq);
        }
    }

    /// Reads from the unibus control page.
    pub(crate) fn unibus_read(&self, offset: u32) -> u32 {
        match offset {
            0o40 => {
                event!(Level::DEBUG, "unibus: read interrupt status");
                0
            }
            0o44 => {
                event!(Level::DEBUG, "unibus: read error status");
                0
            }
            _ => 0,
        }
    }

    /// Writes to the unibus control page.  The mode register (offset
    /// 12) can turn off the boot PROM; offsets 40 and 42 merge into
    /// the interrupt status register.
    pub(crate) fn unibus_write(&mut self, offset: u32, v: u32, irq: &mut InterruptController) {
        match offset {
            0o12 => {
                event!(Level::DEBUG, "unibus: write mode register {:o}", v);
                if v & 0o44 == 0o44 {
                    event!(Level::DEBUG, "unibus: disabling prom enable flag");
                    self.prom_disable_pending = true;
                }
            }
            0o40 => {
                event!(Level::DEBUG, "unibus: write interrupt status {:o}", v);
                irq.merge_status(0o36001, v);
            }
            0o42 => {
                event!(Level::DEBUG, "unibus: write interrupt stim {:o}", v);
                irq.merge_status(0o101774, v);
            }
            0o44 => {
                event!(Level::DEBUG, "unibus: clear bus error {:o}", v);
            }
            0o140..=0o176 => {
                event!(Level::DEBUG, "unibus: mapping reg {:o}", offset);
            }
            _ => {
                event!(Level::DEBUG, "unibus: write? v {:o}, offset {:o}", v, offset);
            }
        }
    }

    /// True once, after the mode register asked for the boot PROM to
    /// be switched out.  The machine acts on this between cycles.
    pub(crate) fn take_prom_disable(&mut self) -> bool {
        std::mem::take(&mut self.prom_disable_pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_register_requests_prom_disable() {
        let mut bus = DeviceBus::new();
        let mut irq = InterruptController::new();
        bus.unibus_write(0o12, 0o4, &mut irq);
        assert!(!bus.take_prom_disable());
        bus.unibus_write(0o12, 0o44, &mut irq);
        assert!(bus.take_prom_disable());
        // One-shot.
        assert!(!bus.take_prom_disable());
    }

    #[test]
    fn interrupt_registers_merge_under_masks() {
        let mut bus = DeviceBus::new();
        let mut irq = InterruptController::new();
        bus.unibus_write(0o40, 0o177777, &mut irq);
        assert_eq!(irq.status(), 0o36001);
        bus.unibus_write(0o42, 0o101774, &mut irq);
        assert_eq!(irq.status(), 0o36001 | 0o101774);
        assert!(irq.pending());
    }

    #[test]
    fn unibus_status_reads_as_zero() {
        let bus = DeviceBus::new();
        assert_eq!(bus.unibus_read(0o40), 0);
        assert_eq!(bus.unibus_read(0o44), 0);
    }
}
