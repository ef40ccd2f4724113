//! The TV (display) controller.
//!
//! The framebuffer occupies one word per 32 pixels behind the
//! hardwired window at virtual 77000000; rendering the pixels is a
//! front-end concern, so the controller just stores the words.  The
//! control/status register lives at XBUS offset 360.  Each coarse
//! poll stands in for a vertical retrace: it sets CSR bit 4 and
//! raises the xbus interrupt, which the microcode acknowledges by
//! rewriting the CSR.

use tracing::{event, Level};

use crate::bus::BusDevice;
use crate::interrupt::InterruptController;
use crate::memory::PhysicalMemory;

/// Word offsets run through the low 15 bits of the virtual address.
const FRAMEBUFFER_WORDS: usize = 0o100000;

const CSR_RETRACE: u32 = 1 << 4;

pub struct TvController {
    framebuffer: Vec<u32>,
    csr: u32,
}

impl Default for TvController {
    fn default() -> TvController {
        TvController::new()
    }
}

impl TvController {
    pub fn new() -> TvController {
        TvController {
            framebuffer: vec![0; FRAMEBUFFER_WORDS],
            csr: 0,
        }
    }

    pub fn read_word(&self, offset: u32) -> u32 {
        match self.framebuffer.get(offset as usize) {
            Some(w) => *w,
            None => {
                event!(Level::WARN, "tv: read past end; offset {:o}", offset);
                0
            }
        }
    }

    pub fn write_word(&mut self, offset: u32, bits: u32) {
        match self.framebuffer.get_mut(offset as usize) {
            Some(w) => *w = bits,
            None => {
                event!(Level::WARN, "tv: write past end; offset {:o}", offset);
            }
        }
    }

    /// The framebuffer contents, one bit per pixel, for a front end
    /// to render.
    pub fn framebuffer(&self) -> &[u32] {
        &self.framebuffer
    }

    pub fn csr(&self) -> u32 {
        self.csr
    }
}

impl BusDevice for TvController {
    fn poll(&mut self, _phys: &mut PhysicalMemory, irq: &mut InterruptController) {
        // Vertical retrace.
        self.csr |= CSR_RETRACE;
        irq.assert_xbus();
    }

    fn read_register(&mut self, _offset: u32, _irq: &mut InterruptController) -> u32 {
        self.csr
    }

    fn write_register(
        &mut self,
        _offset: u32,
        v: u32,
        _phys: &mut PhysicalMemory,
        irq: &mut InterruptController,
    ) {
        self.csr = v & !CSR_RETRACE;
        irq.deassert_xbus();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framebuffer_words_round_trip() {
        let mut tv = TvController::new();
        tv.write_word(0o12345, 0xaaaa_5555);
        assert_eq!(tv.read_word(0o12345), 0xaaaa_5555);
        assert_eq!(tv.read_word(0), 0);
    }

    #[test]
    fn out_of_range_access_is_harmless() {
        let mut tv = TvController::new();
        tv.write_word(0o200000, 1);
        assert_eq!(tv.read_word(0o200000), 0);
    }

    #[test]
    fn retrace_sets_csr_and_interrupts() {
        let mut tv = TvController::new();
        let mut phys = PhysicalMemory::new(16);
        let mut irq = InterruptController::new();
        tv.poll(&mut phys, &mut irq);
        assert_ne!(tv.csr() & CSR_RETRACE, 0);
        assert!(irq.pending());

        // Acknowledging through the CSR clears bit 4 and the line.
        tv.write_register(0o360, 0o37, &mut phys, &mut irq);
        assert_eq!(tv.csr() & CSR_RETRACE, 0);
        assert!(!irq.pending());
        assert_eq!(tv.read_register(0o360, &mut irq), 0o17);
    }
}
