//! The bus interrupt controller.
//!
//! Interrupt state is one packed status register.  Bit 15 is the
//! unibus interrupt pending bit, bit 14 the xbus pending bit, bit 10
//! the unibus interrupt enable, and bits 2-9 hold the unibus vector.
//! Devices assert and deassert level-held interrupt lines here; the
//! engine samples `pending()` when it evaluates the interrupt jump
//! conditions.

use tracing::{event, Level};

const UNIBUS_PENDING: u32 = 0o100000;
const XBUS_PENDING: u32 = 0o040000;
const UNIBUS_ENABLE: u32 = 0o002000;
const VECTOR_MASK: u32 = 0o001774;

#[derive(Debug, Default)]
pub struct InterruptController {
    status: u32,
    pending: bool,
}

impl InterruptController {
    pub fn new() -> InterruptController {
        InterruptController::default()
    }

    fn set_status(&mut self, status: u32) {
        self.status = status;
        self.pending = status & (UNIBUS_PENDING | XBUS_PENDING) != 0;
    }

    pub fn status(&self) -> u32 {
        self.status
    }

    /// True when either bus has an interrupt outstanding.  The engine
    /// additionally gates this by its own interrupt-enable flag.
    pub fn pending(&self) -> bool {
        self.pending
    }

    pub fn assert_unibus(&mut self, vector: u32) {
        if self.status & UNIBUS_ENABLE != 0 {
            event!(Level::DEBUG, "assert: unibus interrupt (enabled)");
            self.set_status(
                (self.status & !VECTOR_MASK) | UNIBUS_PENDING | (vector & VECTOR_MASK),
            );
        } else {
            event!(Level::DEBUG, "assert: unibus interrupt (disabled)");
        }
    }

    pub fn deassert_unibus(&mut self) {
        if self.status & UNIBUS_PENDING != 0 {
            event!(Level::DEBUG, "deassert: unibus interrupt");
            self.set_status(self.status & !(VECTOR_MASK | UNIBUS_PENDING));
        }
    }

    pub fn assert_xbus(&mut self) {
        event!(
            Level::DEBUG,
            "assert: xbus interrupt ({:o})",
            self.status
        );
        self.set_status(self.status | XBUS_PENDING);
    }

    pub fn deassert_xbus(&mut self) {
        if self.status & XBUS_PENDING != 0 {
            event!(Level::DEBUG, "deassert: xbus interrupt");
            self.set_status(self.status & !XBUS_PENDING);
        }
    }

    /// Merge bits into the status register under a mask; this is how
    /// the unibus interrupt control registers are written.
    pub fn merge_status(&mut self, mask: u32, value: u32) {
        self.set_status((self.status & !mask) | (value & mask));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unibus_assert_requires_enable() {
        let mut irq = InterruptController::new();
        irq.assert_unibus(0o260);
        assert!(!irq.pending());
        assert_eq!(irq.status(), 0);

        irq.merge_status(0o36001, UNIBUS_ENABLE);
        irq.assert_unibus(0o260);
        assert!(irq.pending());
        assert_eq!(irq.status() & VECTOR_MASK, 0o260);
        assert_ne!(irq.status() & UNIBUS_PENDING, 0);
    }

    #[test]
    fn unibus_vector_is_masked() {
        let mut irq = InterruptController::new();
        irq.merge_status(0o36001, UNIBUS_ENABLE);
        irq.assert_unibus(0o177777);
        assert_eq!(irq.status() & VECTOR_MASK, 0o1774);
    }

    #[test]
    fn deassert_unibus_clears_vector() {
        let mut irq = InterruptController::new();
        irq.merge_status(0o36001, UNIBUS_ENABLE);
        irq.assert_unibus(0o264);
        irq.deassert_unibus();
        assert!(!irq.pending());
        assert_eq!(irq.status() & (UNIBUS_PENDING | VECTOR_MASK), 0);
        // Enable survives the deassert.
        assert_ne!(irq.status() & UNIBUS_ENABLE, 0);
    }

    #[test]
    fn xbus_is_independent_of_enable() {
        let mut irq = InterruptController::new();
        irq.assert_xbus();
        assert!(irq.pending());
        assert_eq!(irq.status(), XBUS_PENDING);
        irq.deassert_xbus();
        assert!(!irq.pending());
    }

    #[test]
    fn merge_status_respects_mask() {
        let mut irq = InterruptController::new();
        irq.merge_status(0o36001, 0o177777);
        assert_eq!(irq.status(), 0o36001);
        irq.merge_status(0o101774, 0);
        assert_eq!(irq.status(), 0o36001 & !0o101774);
    }
}
