//! The Trident disk controller.
//!
//! Each disk block holds one Lisp machine page (256 words).  The
//! microcode drives the controller through XBUS registers 370-377:
//! it loads a command, a CCW list pointer and a disk address, then
//! pokes the start register.  A CCW list is a chain of physical
//! word addresses; each entry names the page to transfer and its low
//! bit says whether the chain continues.  Commands with bit 4000 set
//! request a completion interrupt, which is delivered a little while
//! later from the poll hook rather than synchronously.

use std::error;
use std::fmt::{self, Display, Formatter};

use serde::Serialize;
use tracing::{event, Level};

use crate::bus::BusDevice;
use crate::interrupt::InterruptController;
use crate::memory::PhysicalMemory;

pub(crate) const BLOCK_WORDS: usize = 256;

/// "LABL" in the pack label's first word.
const LABEL_MAGIC: u32 = 0o11420440514;

/// Polls between command completion and its interrupt.
const INTERRUPT_DELAY: u32 = 2500;

const STATUS_DONE: u32 = 1 << 3;

#[derive(Debug)]
pub enum DiskError {
    /// The image is too small to contain a pack label.
    TooShort(usize),
    /// The first label word was not the LABL magic.
    BadLabel(u32),
}

impl Display for DiskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            DiskError::TooShort(len) => {
                write!(f, "disk image of {len} bytes has no room for a pack label")
            }
            DiskError::BadLabel(found) => {
                write!(f, "invalid pack label ({found:o}) - disk image ignored")
            }
        }
    }
}

impl error::Error for DiskError {}

/// Pack geometry, taken from label words 2-4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskGeometry {
    pub cylinders: u32,
    pub heads: u32,
    pub blocks_per_track: u32,
}

impl DiskGeometry {
    fn block_number(&self, cyl: u32, head: u32, block: u32) -> u32 {
        (cyl * self.blocks_per_track * self.heads) + (head * self.blocks_per_track) + block
    }
}

/// An in-memory disk pack.
pub struct DiskImage {
    words: Vec<u32>,
    geometry: DiskGeometry,
}

impl DiskImage {
    /// Build an image from a validated word vector (block 0 must be
    /// a pack label).
    pub fn from_words(words: Vec<u32>) -> Result<DiskImage, DiskError> {
        if words.len() < BLOCK_WORDS {
            return Err(DiskError::TooShort(words.len() * 4));
        }
        if words[0] != LABEL_MAGIC {
            return Err(DiskError::BadLabel(words[0]));
        }
        let geometry = DiskGeometry {
            cylinders: words[2],
            heads: words[3],
            blocks_per_track: words[4],
        };
        event!(
            Level::INFO,
            "disk: image CHB {:o}/{:o}/{:o}",
            geometry.cylinders,
            geometry.heads,
            geometry.blocks_per_track
        );
        Ok(DiskImage { words, geometry })
    }

    /// Build an image from raw little-endian file contents.
    pub fn from_bytes(bytes: &[u8]) -> Result<DiskImage, DiskError> {
        let words = bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().expect("chunk is 4 bytes")))
            .collect();
        DiskImage::from_words(words)
    }

    pub fn geometry(&self) -> DiskGeometry {
        self.geometry
    }

    /// The image contents, for writing back to a file.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    fn block(&self, block_no: u32) -> Option<&[u32]> {
        let start = block_no as usize * BLOCK_WORDS;
        self.words.get(start..start + BLOCK_WORDS)
    }

    fn block_mut(&mut self, block_no: u32) -> Option<&mut [u32]> {
        let start = block_no as usize * BLOCK_WORDS;
        self.words.get_mut(start..start + BLOCK_WORDS)
    }
}

pub struct DiskController {
    image: Option<DiskImage>,

    status: u32,
    cmd: u32,
    clp: u32,
    ma: u32,
    ecc: u32,
    da: u32,

    cur_unit: u32,
    cur_cyl: u32,
    cur_head: u32,
    cur_block: u32,

    interrupt_delay: u32,
}

impl Default for DiskController {
    fn default() -> DiskController {
        DiskController::new()
    }
}

impl DiskController {
    pub fn new() -> DiskController {
        DiskController {
            image: None,
            status: 1,
            cmd: 0,
            clp: 0,
            ma: 0,
            ecc: 0,
            da: 0,
            cur_unit: 0,
            cur_cyl: 0,
            cur_head: 0,
            cur_block: 0,
            interrupt_delay: 0,
        }
    }

    pub fn attach(&mut self, image: DiskImage) {
        self.image = Some(image);
    }

    pub fn image(&self) -> Option<&DiskImage> {
        self.image.as_ref()
    }

    fn decode_addr(&mut self) {
        self.cur_unit = (self.da >> 28) & 0o7;
        self.cur_cyl = (self.da >> 16) & 0o7777;
        self.cur_head = (self.da >> 8) & 0o377;
        self.cur_block = self.da & 0o377;
    }

    fn undecode_addr(&mut self) {
        self.da = ((self.cur_unit & 0o7) << 28)
            | ((self.cur_cyl & 0o7777) << 16)
            | ((self.cur_head & 0o377) << 8)
            | (self.cur_block & 0o377);
    }

    fn incr_block(&mut self) {
        let Some(image) = self.image.as_ref() else {
            return;
        };
        let geom = image.geometry;
        self.cur_block += 1;
        if self.cur_block >= geom.blocks_per_track {
            self.cur_block = 0;
            self.cur_head += 1;
            if self.cur_head >= geom.heads {
                self.cur_head = 0;
                self.cur_cyl += 1;
            }
        }
    }

    fn read_block(&self, vma: u32, phys: &mut PhysicalMemory) {
        let Some(image) = self.image.as_ref() else {
            event!(Level::WARN, "disk: read with no image attached");
            return;
        };
        let block_no = image
            .geometry
            .block_number(self.cur_cyl, self.cur_head, self.cur_block);
        let Some(block) = image.block(block_no) else {
            event!(Level::WARN, "disk: read past end of image, block {block_no}");
            return;
        };
        event!(Level::DEBUG, "disk: image block {} -> {:o}", block_no, vma);
        for (i, word) in block.iter().enumerate() {
            phys.write(vma + i as u32, *word);
        }
    }

    fn write_block(&mut self, vma: u32, phys: &mut PhysicalMemory) {
        let (cyl, head, blk) = (self.cur_cyl, self.cur_head, self.cur_block);
        let Some(image) = self.image.as_mut() else {
            event!(Level::WARN, "disk: write with no image attached");
            return;
        };
        let block_no = image.geometry.block_number(cyl, head, blk);
        let Some(block) = image.block_mut(block_no) else {
            event!(Level::WARN, "disk: write past end of image, block {block_no}");
            return;
        };
        event!(Level::DEBUG, "disk: image block {} <- {:o}", block_no, vma);
        for (i, word) in block.iter_mut().enumerate() {
            *word = phys.read(vma + i as u32).unwrap_or(0);
        }
    }

    /// Walk the CCW chain, transferring one block per entry.
    fn run_ccw_chain(&mut self, writing: bool, phys: &mut PhysicalMemory) {
        self.decode_addr();

        for _ in 0..65535 {
            let Some(ccw) = phys.read(self.clp) else {
                event!(Level::WARN, "disk: mem[clp={:o}] yielded fault (no page)", self.clp);
                return;
            };
            event!(Level::DEBUG, "disk: mem[clp={:o}] -> ccw {:o}", self.clp, ccw);

            let vma = ccw & !0o377;
            self.ma = vma;
            event!(
                Level::DEBUG,
                "disk: unit {}, CHB {:o}/{:o}/{:o}",
                self.cur_unit,
                self.cur_cyl,
                self.cur_head,
                self.cur_block
            );

            if writing {
                self.write_block(vma, phys);
            } else {
                self.read_block(vma, phys);
            }

            if ccw & 1 == 0 {
                event!(Level::DEBUG, "disk: last ccw");
                break;
            }

            self.incr_block();
            self.clp += 1;
        }

        self.undecode_addr();

        if self.cmd & 0o4000 != 0 {
            self.interrupt_delay = INTERRUPT_DELAY;
        }
    }

    fn start(&mut self, phys: &mut PhysicalMemory) {
        event!(Level::DEBUG, "disk: start, cmd {:o}", self.cmd);
        match self.cmd & 0o1777 {
            0 => self.run_ccw_chain(false, phys),
            0o10 => {
                event!(Level::DEBUG, "disk: read compare (ignored)");
                self.decode_addr();
            }
            0o11 => self.run_ccw_chain(true, phys),
            0o1005 => {
                event!(Level::DEBUG, "disk: recalibrate");
            }
            0o405 => {
                event!(Level::DEBUG, "disk: fault clear");
            }
            other => {
                event!(Level::WARN, "disk: unknown command {:o}", other);
            }
        }
    }
}

impl BusDevice for DiskController {
    fn poll(&mut self, _phys: &mut PhysicalMemory, irq: &mut InterruptController) {
        if self.interrupt_delay > 0 {
            self.interrupt_delay -= 1;
            if self.interrupt_delay == 0 {
                event!(Level::DEBUG, "disk: throw interrupt");
                self.status |= STATUS_DONE;
                irq.assert_xbus();
            }
        }
    }

    fn read_register(&mut self, offset: u32, _irq: &mut InterruptController) -> u32 {
        match offset {
            0o370 | 0o374 => self.status,
            0o371 => self.ma,
            0o372 | 0o376 => self.da,
            0o373 => self.ecc,
            0o375 => self.clp,
            0o377 => 0,
            _ => {
                event!(Level::DEBUG, "disk: unknown reg read {:o}", offset);
                0
            }
        }
    }

    fn write_register(
        &mut self,
        offset: u32,
        v: u32,
        phys: &mut PhysicalMemory,
        irq: &mut InterruptController,
    ) {
        match offset {
            0o370 => {
                event!(Level::DEBUG, "disk: load status {:o}", v);
            }
            0o374 => {
                self.cmd = v;
                if self.cmd & 0o6000 == 0 {
                    irq.deassert_xbus();
                }
                event!(Level::DEBUG, "disk: load cmd {:o}", v);
            }
            0o375 => {
                event!(Level::DEBUG, "disk: load clp {:o}", v);
                self.clp = v;
            }
            0o376 => {
                event!(Level::DEBUG, "disk: load da {:o}", v);
                self.da = v;
            }
            0o377 => {
                self.start(phys);
            }
            _ => {
                event!(Level::DEBUG, "disk: unknown reg write {:o}", offset);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A small pack: 2 cylinders, 2 heads, 4 blocks per track.
    fn test_image() -> DiskImage {
        let blocks = 2 * 2 * 4;
        let mut words = vec![0u32; blocks * BLOCK_WORDS];
        words[0] = LABEL_MAGIC;
        words[2] = 2; // cylinders
        words[3] = 2; // heads
        words[4] = 4; // blocks per track
        // Mark every block with a recognizable first word.
        for b in 1..blocks {
            words[b * BLOCK_WORDS] = 0o1000000 + b as u32;
        }
        DiskImage::from_words(words).expect("label is valid")
    }

    fn controller() -> (DiskController, PhysicalMemory, InterruptController) {
        let mut disk = DiskController::new();
        disk.attach(test_image());
        (disk, PhysicalMemory::new(64), InterruptController::new())
    }

    fn da(cyl: u32, head: u32, block: u32) -> u32 {
        (cyl << 16) | (head << 8) | block
    }

    #[test]
    fn rejects_unlabelled_images() {
        let words = vec![0u32; BLOCK_WORDS];
        assert!(matches!(
            DiskImage::from_words(words),
            Err(DiskError::BadLabel(0))
        ));
        assert!(matches!(
            DiskImage::from_words(vec![0; 4]),
            Err(DiskError::TooShort(16))
        ));
    }

    #[test]
    fn geometry_comes_from_the_label() {
        let image = test_image();
        assert_eq!(
            image.geometry(),
            DiskGeometry {
                cylinders: 2,
                heads: 2,
                blocks_per_track: 4
            }
        );
    }

    #[test]
    fn read_command_transfers_one_block() {
        let (mut disk, mut phys, mut irq) = controller();
        // One-entry CCW chain at physical word 0o100, transferring
        // into the page at 0o2000.
        phys.write(0o100, 0o2000);
        disk.write_register(0o375, 0o100, &mut phys, &mut irq);
        disk.write_register(0o376, da(0, 1, 2), &mut phys, &mut irq);
        disk.write_register(0o374, 0, &mut phys, &mut irq);
        disk.write_register(0o377, 0, &mut phys, &mut irq);

        // Block number 0*8 + 1*4 + 2 = 6.
        assert_eq!(phys.read(0o2000), Some(0o1000006));
        // No interrupt requested.
        assert!(!irq.pending());
        assert_eq!(disk.read_register(0o371, &mut irq), 0o2000);
    }

    #[test]
    fn chained_read_increments_the_disk_address() {
        let (mut disk, mut phys, mut irq) = controller();
        // Two chained CCWs; start at the last block of head 0 so the
        // increment has to carry into the head field.
        phys.write(0o100, 0o2000 | 1);
        phys.write(0o101, 0o2400);
        disk.write_register(0o375, 0o100, &mut phys, &mut irq);
        disk.write_register(0o376, da(0, 0, 3), &mut phys, &mut irq);
        disk.write_register(0o374, 0, &mut phys, &mut irq);
        disk.write_register(0o377, 0, &mut phys, &mut irq);

        assert_eq!(phys.read(0o2000), Some(0o1000003));
        assert_eq!(phys.read(0o2400), Some(0o1000004)); // head 1, block 0
        // The DA register reflects the final position.
        assert_eq!(disk.read_register(0o372, &mut irq), da(0, 1, 0));
    }

    #[test]
    fn write_command_updates_the_image() {
        let (mut disk, mut phys, mut irq) = controller();
        for i in 0..BLOCK_WORDS as u32 {
            phys.write(0o3000 + i, 0o5555 + i);
        }
        phys.write(0o100, 0o3000);
        disk.write_register(0o375, 0o100, &mut phys, &mut irq);
        disk.write_register(0o376, da(1, 0, 0), &mut phys, &mut irq);
        disk.write_register(0o374, 0o11, &mut phys, &mut irq);
        disk.write_register(0o377, 0, &mut phys, &mut irq);

        let image = disk.image().expect("attached above");
        let block_no = 1 * 8; // cylinder 1, head 0, block 0
        assert_eq!(image.words()[block_no * BLOCK_WORDS], 0o5555);
        assert_eq!(image.words()[block_no * BLOCK_WORDS + 255], 0o5555 + 255);
    }

    #[test]
    fn completion_interrupt_is_delayed() {
        let (mut disk, mut phys, mut irq) = controller();
        phys.write(0o100, 0o2000);
        disk.write_register(0o375, 0o100, &mut phys, &mut irq);
        disk.write_register(0o376, da(0, 0, 0), &mut phys, &mut irq);
        disk.write_register(0o374, 0o4000, &mut phys, &mut irq);
        disk.write_register(0o377, 0, &mut phys, &mut irq);

        assert!(!irq.pending());
        for _ in 0..INTERRUPT_DELAY - 1 {
            disk.poll(&mut phys, &mut irq);
        }
        assert!(!irq.pending());
        disk.poll(&mut phys, &mut irq);
        assert!(irq.pending());
        assert_ne!(disk.read_register(0o370, &mut irq) & STATUS_DONE, 0);

        // Loading a command without the interrupt bits drops the line.
        disk.write_register(0o374, 0, &mut phys, &mut irq);
        assert!(!irq.pending());
    }
}
