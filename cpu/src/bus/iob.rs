//! The I/O board: keyboard, mouse, clocks and the command/status
//! register, all reached through unibus register offsets.
//!
//! Keyboard scan codes arrive from the front end via `key_event`;
//! CSR bit 5 means a code is waiting to be read, so further events
//! queue behind it.  CSR bit 2 enables the keyboard interrupt
//! (vector 260) and bit 1 the mouse interrupt (vector 264).  The
//! microsecond clock counts polls, which keeps runs deterministic.
//! The chaosnet register offsets are decoded but the transport is
//! not modeled; they read as zero.

use std::collections::VecDeque;

use tracing::{event, Level};

use crate::bus::BusDevice;
use crate::interrupt::InterruptController;
use crate::memory::PhysicalMemory;

const KEY_QUEUE_LEN: usize = 10;

const CSR_MOUSE_READY: u32 = 1 << 4;
const CSR_KBD_READY: u32 = 1 << 5;
const CSR_KBD_INT_ENABLE: u32 = 1 << 2;

const KBD_VECTOR: u32 = 0o260;
const MOUSE_VECTOR: u32 = 0o264;

pub struct IobDevice {
    csr: u32,
    key_scan: u32,
    key_queue: VecDeque<u32>,

    mouse_x: i32,
    mouse_y: i32,
    mouse_head: bool,
    mouse_middle: bool,
    mouse_tail: bool,
    mouse_rawx: u32,
    mouse_rawy: u32,

    usec_clock: u32,
    usec_latched: u32,
}

impl Default for IobDevice {
    fn default() -> IobDevice {
        IobDevice::new()
    }
}

impl IobDevice {
    pub fn new() -> IobDevice {
        IobDevice {
            csr: 0,
            key_scan: 0,
            key_queue: VecDeque::with_capacity(KEY_QUEUE_LEN),
            mouse_x: 0,
            mouse_y: 0,
            mouse_head: false,
            mouse_middle: false,
            mouse_tail: false,
            mouse_rawx: 0,
            mouse_rawy: 0,
            usec_clock: 0,
            usec_latched: 0,
        }
    }

    pub fn csr(&self) -> u32 {
        self.csr
    }

    /// Deliver a keyboard scan code.  `keydown` false is a release.
    pub fn key_event(&mut self, code: u32, keydown: bool, irq: &mut InterruptController) {
        let v = (u32::from(!keydown) << 8) | (code & 0o377);
        if self.csr & CSR_KBD_READY != 0 {
            // Something is already waiting to be read.
            if self.key_queue.len() < KEY_QUEUE_LEN {
                self.key_queue.push_back((1 << 16) | v);
            } else {
                event!(Level::WARN, "IOB key queue full!");
            }
        } else {
            self.key_scan = (1 << 16) | v;
            if self.csr & CSR_KBD_INT_ENABLE != 0 {
                self.csr |= CSR_KBD_READY;
                irq.assert_unibus(KBD_VECTOR);
            }
        }
    }

    /// Send a Return to get the machine booted.
    pub fn warm_boot_key(&mut self, irq: &mut InterruptController) {
        self.key_event(0o62, false, irq);
    }

    /// Deliver a mouse movement, already reconciled against where
    /// the microcode believes the cursor is.
    pub fn mouse_event(&mut self, dx: i32, dy: i32, buttons: u32, irq: &mut InterruptController) {
        self.csr |= CSR_MOUSE_READY;
        irq.assert_unibus(MOUSE_VECTOR);

        self.mouse_x = self.mouse_x.wrapping_add(dx);
        self.mouse_y = self.mouse_y.wrapping_add(dy);

        if buttons & 4 != 0 {
            self.mouse_head = true;
        }
        if buttons & 2 != 0 {
            self.mouse_middle = true;
        }
        if buttons & 1 != 0 {
            self.mouse_tail = true;
        }
    }

    fn dequeue_key_event(&mut self, irq: &mut InterruptController) {
        if self.csr & CSR_KBD_READY != 0 {
            // Still something to be read.
            return;
        }
        if let Some(v) = self.key_queue.pop_front() {
            self.key_scan = (1 << 16) | v;
            if self.csr & CSR_KBD_INT_ENABLE != 0 {
                self.csr |= CSR_KBD_READY;
                irq.assert_unibus(KBD_VECTOR);
            }
        }
    }
}

impl BusDevice for IobDevice {
    fn poll(&mut self, _phys: &mut PhysicalMemory, irq: &mut InterruptController) {
        self.usec_clock = self.usec_clock.wrapping_add(1);
        self.dequeue_key_event(irq);
    }

    fn read_register(&mut self, offset: u32, _irq: &mut InterruptController) -> u32 {
        match offset {
            0o100 => {
                self.csr &= !CSR_KBD_READY;
                self.key_scan & 0o177777
            }
            0o102 => {
                self.csr &= !CSR_KBD_READY;
                (self.key_scan >> 16) & 0o177777
            }
            0o104 => {
                let v = (u32::from(self.mouse_tail) << 12)
                    | (u32::from(self.mouse_middle) << 13)
                    | (u32::from(self.mouse_head) << 14)
                    | ((self.mouse_y as u32) & 0o7777);
                self.mouse_tail = false;
                self.mouse_middle = false;
                self.mouse_head = false;
                self.csr &= !CSR_MOUSE_READY;
                v
            }
            0o106 => {
                (self.mouse_rawx << 12)
                    | (self.mouse_rawy << 14)
                    | ((self.mouse_x as u32) & 0o7777)
            }
            0o110 => {
                event!(Level::INFO, "iob: beep");
                0
            }
            0o112 => self.csr,
            0o120 => {
                self.usec_latched = self.usec_clock;
                self.usec_latched & 0xffff
            }
            0o122 => self.usec_latched >> 16,
            0o124 => 0, // 60hz clock
            0o140..=0o152 => {
                event!(Level::DEBUG, "iob: chaos read {:o}", offset);
                0
            }
            _ => 0,
        }
    }

    fn write_register(
        &mut self,
        offset: u32,
        v: u32,
        _phys: &mut PhysicalMemory,
        _irq: &mut InterruptController,
    ) {
        match offset {
            0o112 => {
                self.csr = (self.csr & !0o17) | (v & 0o17);
            }
            0o140..=0o152 => {
                event!(Level::DEBUG, "iob: chaos write {:o} <- {:o}", offset, v);
            }
            _ => {
                event!(Level::DEBUG, "iob: write {:o} <- {:o}", offset, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (IobDevice, PhysicalMemory, InterruptController) {
        let mut irq = InterruptController::new();
        // Enable unibus interrupts at the controller.
        irq.merge_status(0o36001, 0o2000);
        (IobDevice::new(), PhysicalMemory::new(16), irq)
    }

    fn enable_kbd_interrupt(iob: &mut IobDevice, phys: &mut PhysicalMemory, irq: &mut InterruptController) {
        iob.write_register(0o112, CSR_KBD_INT_ENABLE, phys, irq);
    }

    #[test]
    fn key_event_latches_scan_code_and_interrupts() {
        let (mut iob, mut phys, mut irq) = fixture();
        enable_kbd_interrupt(&mut iob, &mut phys, &mut irq);
        iob.key_event(0o62, false, &mut irq);
        assert!(irq.pending());
        assert_eq!(irq.status() & 0o1774, KBD_VECTOR);
        // Key-up bit 8 plus the code, ready bit set.
        assert_ne!(iob.csr() & CSR_KBD_READY, 0);
        assert_eq!(iob.read_register(0o100, &mut irq), 0o462);
        // The read clears the ready bit.
        assert_eq!(iob.csr() & CSR_KBD_READY, 0);
    }

    #[test]
    fn key_interrupt_respects_enable_bit() {
        let (mut iob, _, mut irq) = fixture();
        iob.key_event(0o62, true, &mut irq);
        assert!(!irq.pending());
        assert_eq!(iob.read_register(0o100, &mut irq), 0o62);
    }

    #[test]
    fn second_key_queues_until_first_is_read() {
        let (mut iob, mut phys, mut irq) = fixture();
        enable_kbd_interrupt(&mut iob, &mut phys, &mut irq);
        iob.key_event(0o11, true, &mut irq);
        iob.key_event(0o22, true, &mut irq);
        // First code still latched.
        assert_eq!(iob.read_register(0o100, &mut irq) & 0o377, 0o11);
        // Polling promotes the queued code and re-interrupts.
        irq.deassert_unibus();
        iob.poll(&mut phys, &mut irq);
        assert!(irq.pending());
        assert_eq!(iob.read_register(0o100, &mut irq) & 0o377, 0o22);
    }

    #[test]
    fn mouse_event_and_register_reads() {
        let (mut iob, _, mut irq) = fixture();
        iob.mouse_event(5, -3, 0b101, &mut irq);
        assert!(irq.pending());
        assert_eq!(irq.status() & 0o1774, MOUSE_VECTOR);

        let y = iob.read_register(0o104, &mut irq);
        assert_eq!(y & 0o7777, (-3i32 as u32) & 0o7777);
        assert_ne!(y & (1 << 14), 0); // head button
        assert_eq!(y & (1 << 13), 0); // middle button
        assert_ne!(y & (1 << 12), 0); // tail button
        assert_eq!(iob.csr() & CSR_MOUSE_READY, 0);

        // Buttons are one-shot.
        let y2 = iob.read_register(0o104, &mut irq);
        assert_eq!(y2 & (0b111 << 12), 0);

        let x = iob.read_register(0o106, &mut irq);
        assert_eq!(x & 0o7777, 5);
    }

    #[test]
    fn usec_clock_latches_on_low_read(){
        let (mut iob, mut phys, mut irq) = fixture();
        for _ in 0..0x12345 {
            iob.poll(&mut phys, &mut irq);
        }
        assert_eq!(iob.read_register(0o120, &mut irq), 0x2345);
        assert_eq!(iob.read_register(0o122, &mut irq), 0x1);
    }
}
