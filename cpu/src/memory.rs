//! This module emulates the CADR memory system.
//!
//! Physical memory is a sparse set of 256-word pages (16384 page
//! frames of address space, of which the low `ram_pages` are real
//! RAM).  Pages are allocated on first use and never freed.
//!
//! Virtual addresses are 24 bits and translate through a two-level
//! map: an 11-bit L1 index selects a 5-bit bucket, which together
//! with virtual address bits 12-8 selects one of 1024 L2 entries.
//! An L2 entry carries an access bit (23), a write-permission bit
//! (22) and a 14-bit physical page number.  A few address windows
//! (the display framebuffer and the XBUS I/O page) are translated by
//! hardwired comparators before the table walk.
//!
//! Translation failures are not errors in the Result sense: the
//! hardware latches fault lines which the microcode inspects through
//! jump conditions and the memory-map F-source.  `read_virtual` and
//! `write_virtual` therefore return `Option` and leave the fault
//! flags set on the unit.

use std::error;
use std::fmt::{self, Display, Formatter};
use std::io::{self, Read, Write};

use tracing::{event, Level};

use crate::bus::{BusDevice, DeviceBus};
use crate::interrupt::InterruptController;

pub(crate) const PAGE_WORDS: usize = 256;
pub(crate) const PAGE_FRAMES: usize = 16 * 1024;
pub(crate) const SNAPSHOT_PAGES: usize = 8192;

/// Default number of real RAM pages (2 MW).
pub const DEFAULT_RAM_PAGES: usize = 8192;

const L2_ACCESS: u32 = 1 << 23;
const L2_WRITE: u32 = 1 << 22;

// Physical page numbers of the memory-mapped peripherals.
const PN_TV: u32 = 0o36000;
const PN_XBUS_IO: u32 = 0o36777;
const PN_TV_REGS: u32 = 0o37760;
const PN_IOB: u32 = 0o37764;
const PN_UNIBUS: u32 = 0o37766;

type PageBox = Box<[u32; PAGE_WORDS]>;

/// Failure to save or restore a physical-memory snapshot.
#[derive(Debug)]
pub enum SnapshotError {
    Io(io::Error),
}

impl Display for SnapshotError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            SnapshotError::Io(e) => write!(f, "snapshot I/O failed: {e}"),
        }
    }
}

impl error::Error for SnapshotError {}

impl From<io::Error> for SnapshotError {
    fn from(e: io::Error) -> SnapshotError {
        SnapshotError::Io(e)
    }
}

/// Sparse paged physical memory.
pub struct PhysicalMemory {
    pages: Vec<Option<PageBox>>,
    ram_pages: usize,
}

impl PhysicalMemory {
    pub fn new(ram_pages: usize) -> PhysicalMemory {
        let mut pages = Vec::with_capacity(PAGE_FRAMES);
        pages.resize_with(PAGE_FRAMES, || None);
        PhysicalMemory { pages, ram_pages }
    }

    pub fn ram_pages(&self) -> usize {
        self.ram_pages
    }

    pub(crate) fn page_exists(&self, pn: u32) -> bool {
        self.pages
            .get(pn as usize)
            .map(Option::is_some)
            .unwrap_or(false)
    }

    /// Allocate a page frame if it does not exist yet.  Called in
    /// response to L2 map writes and to physical access to RAM.
    pub(crate) fn add_page(&mut self, pn: u32) {
        let slot = &mut self.pages[(pn as usize) & (PAGE_FRAMES - 1)];
        if slot.is_none() {
            *slot = Some(Box::new([0; PAGE_WORDS]));
        }
    }

    pub(crate) fn page_word(&self, pn: u32, offset: u32) -> Option<u32> {
        self.pages[(pn as usize) & (PAGE_FRAMES - 1)]
            .as_ref()
            .map(|page| page[(offset as usize) & (PAGE_WORDS - 1)])
    }

    pub(crate) fn set_page_word(&mut self, pn: u32, offset: u32, v: u32) -> bool {
        match self.pages[(pn as usize) & (PAGE_FRAMES - 1)].as_mut() {
            Some(page) => {
                page[(offset as usize) & (PAGE_WORDS - 1)] = v;
                true
            }
            None => false,
        }
    }

    /// Read a word by physical word address, with no virtual mapping
    /// (used by the disk controller's DMA).  RAM pages are allocated
    /// lazily here.
    pub fn read(&mut self, paddr: u32) -> Option<u32> {
        let pn = paddr >> 8;
        if !self.page_exists(pn) {
            if (pn as usize) < self.ram_pages {
                event!(Level::DEBUG, "adding phy ram page {:o} (address {:o})", pn, paddr);
                self.add_page(pn);
            } else {
                event!(Level::DEBUG, "physical address {:o} does not exist", paddr);
                return None;
            }
        }
        self.page_word(pn, paddr & 0o377)
    }

    /// Write a word by physical word address.
    pub fn write(&mut self, paddr: u32, v: u32) -> Option<()> {
        let pn = paddr >> 8;
        if !self.page_exists(pn) {
            if (pn as usize) < self.ram_pages {
                event!(Level::DEBUG, "adding phy ram page {:o} (address {:o})", pn, paddr);
                self.add_page(pn);
            } else {
                event!(Level::DEBUG, "physical address {:o} does not exist", paddr);
                return None;
            }
        }
        if self.set_page_word(pn, paddr & 0o377, v) {
            Some(())
        } else {
            None
        }
    }

    /// Dump the first 8192 pages as a flat little-endian image.
    pub fn save_snapshot<W: Write>(&mut self, out: &mut W) -> Result<(), SnapshotError> {
        let mut buf = [0u8; PAGE_WORDS * 4];
        for pn in 0..SNAPSHOT_PAGES as u32 {
            self.add_page(pn);
            let page = self.pages[pn as usize]
                .as_ref()
                .expect("page was just allocated");
            for (i, word) in page.iter().enumerate() {
                buf[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
            }
            out.write_all(&buf)?;
        }
        Ok(())
    }

    /// Load a snapshot previously written by `save_snapshot`.
    pub fn restore_snapshot<R: Read>(&mut self, input: &mut R) -> Result<(), SnapshotError> {
        let mut buf = [0u8; PAGE_WORDS * 4];
        for pn in 0..SNAPSHOT_PAGES as u32 {
            input.read_exact(&mut buf)?;
            self.add_page(pn);
            let page = self.pages[pn as usize]
                .as_mut()
                .expect("page was just allocated");
            for (i, word) in page.iter_mut().enumerate() {
                *word = u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().expect("chunk is 4 bytes"));
            }
        }
        Ok(())
    }
}

/// Result of a virtual-to-physical translation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Translation {
    /// Raw L2 entry (access bit 23, write bit 22, physical page in
    /// the low 14 bits).
    pub(crate) l2: u32,
    /// The 5-bit L1 bucket the walk went through (zero for the
    /// hardwired windows).
    pub(crate) l1: u32,
    /// Word offset within the page.
    pub(crate) offset: u32,
}

/// The memory unit: physical memory plus the two-level page map and
/// the fault lines.
pub struct MemoryUnit {
    pub(crate) phys: PhysicalMemory,
    l1_map: Box<[u8; 2048]>,
    l2_map: Box<[u32; 1024]>,

    // One-entry translation cache.  It is written on every table
    // walk and invalidated on every map write, but never consulted;
    // the hardware used it only as diagnostic state.
    last_virt: u32,
    last_l1: u32,
    last_l2: u32,

    pub(crate) access_fault: bool,
    pub(crate) write_fault: bool,
    pub(crate) page_fault: bool,
    /// Physical page number captured on the most recent fault.
    pub(crate) fault_page: u32,
}

impl MemoryUnit {
    pub fn new(ram_pages: usize) -> MemoryUnit {
        MemoryUnit {
            phys: PhysicalMemory::new(ram_pages),
            l1_map: Box::new([0; 2048]),
            l2_map: Box::new([0; 1024]),
            last_virt: 0xffff_ff00,
            last_l1: 0,
            last_l2: 0,
            access_fault: false,
            write_fault: false,
            page_fault: false,
            fault_page: 0,
        }
    }

    pub(crate) fn invalidate_translation_cache(&mut self) {
        self.last_virt = 0xffff_ff00;
    }

    #[cfg(test)]
    pub(crate) fn translation_cache(&self) -> (u32, u32, u32) {
        (self.last_virt, self.last_l1, self.last_l2)
    }

    pub(crate) fn l1_entry(&self, index: usize) -> u8 {
        self.l1_map[index & 0o3777]
    }

    pub(crate) fn l2_entry(&self, index: usize) -> u32 {
        self.l2_map[index & 0o1777]
    }

    /// Map a virtual address to its L2 entry, L1 bucket and page
    /// offset.  The hardwired windows for the framebuffer, the color
    /// probe and the XBUS I/O page take precedence over the table
    /// walk.
    pub(crate) fn map_vtop(&mut self, virt: u32) -> Translation {
        let virt = virt & 0o77777777; // 24-bit address.

        // Frame buffer and color windows.
        if (virt & 0o77700000) == 0o77000000 || (virt & 0o77700000) == 0o77200000 {
            return Translation {
                l2: L2_ACCESS | L2_WRITE | PN_TV,
                l1: 0,
                offset: virt & 0o377,
            };
        }

        // XBUS I/O page.
        if (virt & 0o77777400) == 0o77377400 {
            return Translation {
                l2: L2_ACCESS | L2_WRITE | PN_XBUS_IO,
                l1: 0,
                offset: virt & 0o377,
            };
        }

        let l1_index = ((virt >> 13) & 0o3777) as usize;
        let l1 = u32::from(self.l1_map[l1_index]) & 0o37;
        let l2_index = ((l1 << 5) | ((virt >> 8) & 0o37)) as usize;
        let l2 = self.l2_map[l2_index];

        self.last_virt = virt & 0xffff_ff00;
        self.last_l1 = l1;
        self.last_l2 = l2;

        Translation {
            l2,
            l1,
            offset: virt & 0o377,
        }
    }

    /// Write the page map, driven by the VMA-write-map destination:
    /// VMA bit 26 loads an L1 entry and bit 25 loads an L2 entry, in
    /// both cases indexed through MD.  A new L2 entry allocates the
    /// physical page it names.
    pub(crate) fn write_map(&mut self, vma: u32, md: u32) {
        if (vma >> 26) & 1 != 0 {
            let l1_index = ((md >> 13) & 0o3777) as usize;
            let l1_data = ((vma >> 27) & 0o37) as u8;
            self.l1_map[l1_index] = l1_data;
            self.invalidate_translation_cache();
            event!(Level::TRACE, "l1_map[{:o}] <- {:o}", l1_index, l1_data);
        }

        if (vma >> 25) & 1 != 0 {
            let l1_index = ((md >> 13) & 0o3777) as usize;
            let l1_data = u32::from(self.l1_map[l1_index]);
            let l2_index = ((l1_data << 5) | ((md >> 8) & 0o37)) as usize;
            self.l2_map[l2_index & 0o1777] = vma;
            self.invalidate_translation_cache();
            event!(Level::TRACE, "l2_map[{:o}] <- {:o}", l2_index, vma);
            self.phys.add_page(vma & 0o37777);
        }
    }

    fn clear_faults(&mut self) {
        self.access_fault = false;
        self.write_fault = false;
        self.page_fault = false;
    }

    /// Read through the virtual map.  Returns `None` on a fault with
    /// the fault flags latched; the caller's destination register
    /// must be left unmodified in that case.
    pub(crate) fn read_virtual(
        &mut self,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
        vaddr: u32,
    ) -> Option<u32> {
        self.clear_faults();

        let t = self.map_vtop(vaddr);
        let pn = t.l2 & 0o37777;

        if t.l2 & L2_ACCESS == 0 {
            self.access_fault = true;
            self.page_fault = true;
            self.fault_page = pn;
            event!(Level::DEBUG, "read_virtual(vaddr={:o}) access fault", vaddr);
            return None;
        }

        if pn < 0o20000 {
            if let Some(w) = self.phys.page_word(pn, t.offset) {
                return Some(w);
            }
        }

        // Addresses beyond the configured RAM size but below the
        // peripheral region read as all-ones, like floating bus lines.
        if pn >= self.phys.ram_pages as u32 && pn <= 0o35777 {
            return Some(0xffff_ffff);
        }

        match pn {
            PN_TV => {
                // Inhibit the color probe.
                if (vaddr & 0o77700000) == 0o77200000 {
                    return Some(0);
                }
                return Some(bus.tv.read_word(vaddr & 0o77777));
            }
            PN_IOB => {
                return Some(bus.iob.read_register(t.offset << 1, irq));
            }
            PN_UNIBUS => {
                return Some(bus.unibus_read(t.offset));
            }
            PN_XBUS_IO => {
                if t.offset >= 0o370 {
                    return Some(bus.disk.read_register(t.offset, irq));
                }
                if t.offset == 0o360 {
                    return Some(bus.tv.read_register(t.offset, irq));
                }
                event!(Level::DEBUG, "xbus read {:o} {:o}", t.offset, vaddr);
                return Some(0);
            }
            _ => {}
        }

        match self.phys.page_word(pn, t.offset) {
            Some(w) => Some(w),
            None => {
                self.page_fault = true;
                self.fault_page = pn;
                event!(Level::DEBUG, "read_virtual(vaddr={:o}) page fault", vaddr);
                None
            }
        }
    }

    /// Write through the virtual map.  `None` on a fault, with the
    /// fault flags latched.
    pub(crate) fn write_virtual(
        &mut self,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
        vaddr: u32,
        v: u32,
    ) -> Option<()> {
        self.clear_faults();

        let t = self.map_vtop(vaddr);
        let pn = t.l2 & 0o37777;

        if t.l2 & L2_ACCESS == 0 {
            self.access_fault = true;
            self.page_fault = true;
            self.fault_page = pn;
            event!(Level::DEBUG, "write_virtual(vaddr={:o}) access fault", vaddr);
            return None;
        }

        if t.l2 & L2_WRITE == 0 {
            self.write_fault = true;
            self.page_fault = true;
            self.fault_page = pn;
            event!(Level::DEBUG, "write_virtual(vaddr={:o}) write fault", vaddr);
            return None;
        }

        if pn < 0o20000 && self.phys.page_exists(pn) {
            self.phys.set_page_word(pn, t.offset, v);
            return Some(());
        }

        match pn {
            PN_TV => {
                if (vaddr & 0o77700000) == 0o77200000 {
                    return Some(());
                }
                bus.tv.write_word(vaddr & 0o77777, v);
                return Some(());
            }
            PN_TV_REGS => {
                event!(
                    Level::DEBUG,
                    "tv: reg write {:o}, offset {:o}, v {:o}",
                    vaddr,
                    t.offset,
                    v
                );
                return Some(());
            }
            PN_IOB => {
                bus.iob
                    .write_register(t.offset << 1, v, &mut self.phys, irq);
                return Some(());
            }
            PN_UNIBUS => {
                bus.unibus_write(t.offset << 1, v, irq);
                return Some(());
            }
            PN_XBUS_IO => {
                if t.offset >= 0o370 {
                    bus.disk.write_register(t.offset, v, &mut self.phys, irq);
                } else if t.offset == 0o360 {
                    bus.tv.write_register(t.offset, v, &mut self.phys, irq);
                }
                return Some(());
            }
            _ => {}
        }

        if pn >= 0o36000 {
            event!(
                Level::DEBUG,
                "questionable write: vaddr {:o}, pn {:o}, offset {:o}, v {:o}",
                vaddr,
                pn,
                t.offset,
                v
            );
        }

        if self.phys.set_page_word(pn, t.offset, v) {
            Some(())
        } else {
            self.page_fault = true;
            self.fault_page = pn;
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DeviceBus;
    use std::io::Cursor;

    fn unit() -> (MemoryUnit, DeviceBus, InterruptController) {
        (
            MemoryUnit::new(DEFAULT_RAM_PAGES),
            DeviceBus::new(),
            InterruptController::new(),
        )
    }

    // Build an L2 entry mapping one virtual page.
    fn map_page(mem: &mut MemoryUnit, virt_page: u32, l2_entry: u32) {
        // An L1 load takes the bucket from VMA bits 31-27 and the
        // index from MD bits 23-13; an L2 load is indexed through the
        // bucket and MD bits 12-8.
        let md = virt_page << 8;
        mem.write_map((1 << 26) | (1 << 27), md); // bucket 1
        mem.write_map((1 << 25) | l2_entry, md);
    }

    #[test]
    fn fixed_windows_take_precedence() {
        let (mut mem, _, _) = unit();
        let t = mem.map_vtop(0o77012345);
        assert_eq!(t.l2 & 0o37777, 0o36000);
        assert_ne!(t.l2 & L2_ACCESS, 0);
        assert_ne!(t.l2 & L2_WRITE, 0);

        let t = mem.map_vtop(0o77377512);
        assert_eq!(t.l2 & 0o37777, 0o36777);
        assert_eq!(t.offset, 0o112);
    }

    #[test]
    fn table_walk_uses_both_levels() {
        let (mut mem, _, _) = unit();
        map_page(&mut mem, 0o1234, L2_ACCESS | L2_WRITE | 0o42);
        let t = mem.map_vtop(0o1234 << 8 | 0o17);
        assert_eq!(t.l2 & 0o37777, 0o42);
        assert_eq!(t.offset, 0o17);
        assert_eq!(t.l1, 1);
    }

    #[test]
    fn map_write_invalidates_translation_cache() {
        let (mut mem, _, _) = unit();
        map_page(&mut mem, 0o1234, L2_ACCESS | L2_WRITE | 0o42);
        mem.map_vtop(0o1234 << 8);
        let (virt, _, l2) = mem.translation_cache();
        assert_eq!(virt, 0o1234 << 8);
        assert_eq!(l2 & 0o37777, 0o42);

        // Remap the same page; the cached entry must be discarded
        // and the next walk must see the new mapping.
        map_page(&mut mem, 0o1234, L2_ACCESS | L2_WRITE | 0o43);
        let (virt, _, _) = mem.translation_cache();
        assert_eq!(virt, 0xffff_ff00);
        let t = mem.map_vtop(0o1234 << 8);
        assert_eq!(t.l2 & 0o37777, 0o43);
    }

    #[test]
    fn l2_map_write_allocates_the_page() {
        let (mut mem, _, _) = unit();
        assert!(!mem.phys.page_exists(0o42));
        map_page(&mut mem, 0o1234, L2_ACCESS | L2_WRITE | 0o42);
        assert!(mem.phys.page_exists(0o42));
    }

    #[test]
    fn denied_read_sets_fault_flags() {
        let (mut mem, mut bus, mut irq) = unit();
        map_page(&mut mem, 0o1234, 0o42); // no access bit
        assert_eq!(mem.read_virtual(&mut bus, &mut irq, 0o1234 << 8), None);
        assert!(mem.access_fault);
        assert!(mem.page_fault);
        assert!(!mem.write_fault);
        assert_eq!(mem.fault_page, 0o42);
    }

    #[test]
    fn write_without_permission_faults() {
        let (mut mem, mut bus, mut irq) = unit();
        map_page(&mut mem, 0o1234, L2_ACCESS | 0o42);
        assert_eq!(
            mem.write_virtual(&mut bus, &mut irq, 0o1234 << 8, 0o777),
            None
        );
        assert!(mem.write_fault);
        assert!(mem.page_fault);
        assert!(!mem.access_fault);
    }

    #[test]
    fn mapped_read_and_write_round_trip() {
        let (mut mem, mut bus, mut irq) = unit();
        map_page(&mut mem, 0o1234, L2_ACCESS | L2_WRITE | 0o42);
        let vaddr = (0o1234 << 8) | 0o33;
        assert_eq!(
            mem.write_virtual(&mut bus, &mut irq, vaddr, 0o52525252),
            Some(())
        );
        assert_eq!(
            mem.read_virtual(&mut bus, &mut irq, vaddr),
            Some(0o52525252)
        );
        // Same word via the physical path.
        assert_eq!(mem.phys.read((0o42 << 8) | 0o33), Some(0o52525252));
    }

    #[test]
    fn xbus_window_routes_to_device_registers() {
        let (mut mem, mut bus, mut irq) = unit();
        // The disk status register through the hardwired XBUS window.
        assert_eq!(mem.read_virtual(&mut bus, &mut irq, 0o77377770), Some(1));
        // A CLP register write lands in the controller and reads back.
        assert_eq!(
            mem.write_virtual(&mut bus, &mut irq, 0o77377775, 0o4321),
            Some(())
        );
        assert_eq!(
            mem.read_virtual(&mut bus, &mut irq, 0o77377775),
            Some(0o4321)
        );
    }

    #[test]
    fn absent_ram_window_reads_all_ones() {
        let (mut mem, mut bus, mut irq) = unit();
        // Map to a page just beyond the configured RAM but below the
        // peripheral region.
        map_page(&mut mem, 0o1234, L2_ACCESS | 0o20001);
        assert_eq!(
            mem.read_virtual(&mut bus, &mut irq, 0o1234 << 8),
            Some(0xffff_ffff)
        );
    }

    #[test]
    fn physical_ram_is_lazily_allocated() {
        let mut phys = PhysicalMemory::new(16);
        assert!(!phys.page_exists(3));
        assert_eq!(phys.read(3 << 8 | 0o5), Some(0));
        assert!(phys.page_exists(3));
        assert_eq!(phys.write(17 << 8, 1), None); // beyond RAM
    }

    #[test]
    fn snapshot_round_trip() {
        let mut phys = PhysicalMemory::new(DEFAULT_RAM_PAGES);
        phys.write(0o33, 0o1234567);
        phys.write((100 << 8) | 7, 0xdead_beef);
        let mut image = Vec::new();
        phys.save_snapshot(&mut image)
            .expect("writing to a Vec cannot fail");
        assert_eq!(image.len(), SNAPSHOT_PAGES * PAGE_WORDS * 4);

        let mut other = PhysicalMemory::new(DEFAULT_RAM_PAGES);
        other
            .restore_snapshot(&mut Cursor::new(&image))
            .expect("image is complete");
        assert_eq!(other.read(0o33), Some(0o1234567));
        assert_eq!(other.read((100 << 8) | 7), Some(0xdead_beef));
    }

    #[test]
    fn truncated_snapshot_is_an_error() {
        let mut phys = PhysicalMemory::new(DEFAULT_RAM_PAGES);
        let short = vec![0u8; 100];
        assert!(phys.restore_snapshot(&mut Cursor::new(&short)).is_err());
    }
}
