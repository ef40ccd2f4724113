//! The whole machine: engine, memory, peripherals and the interrupt
//! controller, stepped in lockstep.  This is the only layer that
//! owns state; nothing here is global, so several machines can run
//! side by side in one process.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use tracing::{event, Level};

use crate::bus::{DeviceBus, DiskImage};
use crate::engine::Engine;
use crate::interrupt::InterruptController;
use crate::memory::{MemoryUnit, SnapshotError, DEFAULT_RAM_PAGES};
use crate::prom::{self, PromError};

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The microcode executed a halt.
    Halted,
    /// The configured cycle limit was reached.
    CycleLimit,
}

pub struct MachineConfig {
    pub ram_pages: usize,
    /// Skip the cold boot: when the microcode switches the PROM out,
    /// restore main memory from the snapshot file and wake the boot
    /// keyboard loop.
    pub warm_boot: bool,
    pub snapshot_file: Option<PathBuf>,
    pub max_cycles: Option<u64>,
    /// A-memory locations where the microcode keeps its idea of the
    /// mouse position; host coordinates are reconciled against them.
    pub mouse_slot_x: usize,
    pub mouse_slot_y: usize,
}

impl Default for MachineConfig {
    fn default() -> MachineConfig {
        MachineConfig {
            ram_pages: DEFAULT_RAM_PAGES,
            warm_boot: false,
            snapshot_file: None,
            max_cycles: None,
            mouse_slot_x: 334,
            mouse_slot_y: 335,
        }
    }
}

pub struct Machine {
    config: MachineConfig,
    engine: Engine,
    mem: MemoryUnit,
    bus: DeviceBus,
    irq: InterruptController,
    restored: bool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Machine {
        let mut mem = MemoryUnit::new(config.ram_pages);
        // Page 0 exists from power-on; the boot PROM scribbles on it
        // before any map entry is written.
        mem.phys.add_page(0);

        Machine {
            config,
            engine: Engine::new(),
            mem,
            bus: DeviceBus::new(),
            irq: InterruptController::new(),
            restored: false,
        }
    }

    pub fn halted(&self) -> bool {
        self.engine.halted()
    }

    pub fn cycles(&self) -> u64 {
        self.engine.cycles()
    }

    /// Load the boot PROM image the machine starts executing from.
    pub fn load_prom<R: Read>(&mut self, input: &mut R) -> Result<(), PromError> {
        self.engine.prom = prom::load_prom(input)?;
        Ok(())
    }

    pub fn attach_disk(&mut self, image: DiskImage) {
        self.bus.disk.attach(image);
    }

    pub fn disk_image(&self) -> Option<&DiskImage> {
        self.bus.disk.image()
    }

    /// One machine cycle: devices first, then the engine, then any
    /// bus-side requests that change how the engine fetches.
    pub fn step(&mut self) {
        self.bus
            .poll(self.engine.cycles(), &mut self.mem.phys, &mut self.irq);
        self.engine.step(&mut self.mem, &mut self.bus, &mut self.irq);
        if self.bus.take_prom_disable() {
            self.handle_prom_disable();
        }
    }

    fn handle_prom_disable(&mut self) {
        event!(
            Level::INFO,
            "prom disabled after {} cycles",
            self.engine.cycles()
        );
        self.engine.prom_enabled = false;

        if self.config.warm_boot && !self.restored {
            self.restored = true;
            match self.config.snapshot_file.clone() {
                Some(path) => match File::open(&path) {
                    Ok(mut f) => match self.mem.phys.restore_snapshot(&mut f) {
                        Ok(()) => {
                            event!(
                                Level::INFO,
                                "warm boot: memory restored from {}",
                                path.display()
                            );
                            self.bus.iob.warm_boot_key(&mut self.irq);
                        }
                        Err(e) => {
                            event!(Level::ERROR, "warm boot restore failed: {e}");
                        }
                    },
                    Err(e) => {
                        event!(
                            Level::ERROR,
                            "warm boot: cannot open {}: {e}",
                            path.display()
                        );
                    }
                },
                None => {
                    event!(Level::WARN, "warm boot requested without a snapshot file");
                }
            }
        }
    }

    pub fn run(&mut self) -> RunOutcome {
        loop {
            if self.engine.halted() {
                return RunOutcome::Halted;
            }
            if let Some(limit) = self.config.max_cycles {
                if self.engine.cycles() >= limit {
                    event!(Level::INFO, "cycle limit {} reached", limit);
                    return RunOutcome::CycleLimit;
                }
            }
            self.step();
        }
    }

    pub fn key_event(&mut self, code: u32, keydown: bool) {
        self.bus.iob.key_event(code, keydown, &mut self.irq);
    }

    pub fn warm_boot_key(&mut self) {
        self.bus.iob.warm_boot_key(&mut self.irq);
    }

    /// Deliver an absolute host cursor position.  The delta handed to
    /// the I/O board is measured against where the microcode believes
    /// the cursor is, read back out of A-memory.
    pub fn mouse_event(&mut self, x: u32, y: u32, buttons: u32) {
        let cur_x = self.engine.read_a_mem(self.config.mouse_slot_x);
        let cur_y = self.engine.read_a_mem(self.config.mouse_slot_y);
        let dx = x.wrapping_sub(cur_x) as i32;
        let dy = y.wrapping_sub(cur_y) as i32;
        self.bus.iob.mouse_event(dx, dy, buttons, &mut self.irq);
    }

    pub fn framebuffer(&self) -> &[u32] {
        self.bus.tv.framebuffer()
    }

    pub fn save_snapshot<W: Write>(&mut self, out: &mut W) -> Result<(), SnapshotError> {
        self.mem.phys.save_snapshot(out)
    }

    pub fn restore_snapshot<R: Read>(&mut self, input: &mut R) -> Result<(), SnapshotError> {
        self.mem.phys.restore_snapshot(input)
    }

    /// Write a human-readable dump of the engine state, for post
    /// mortem inspection.
    pub fn dump_state<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let e = &self.engine;

        writeln!(out, "cycles {}, pc {:o}", e.cycles, e.pc)?;
        writeln!(
            out,
            "lc {:o}, vma {:o}, md {:o}, q {:o}, opc {:o}",
            e.lc, e.vma, e.md, e.q, e.opc
        )?;
        writeln!(
            out,
            "pdl ptr {:o}, pdl index {:o}, spc ptr {:o}",
            e.pdl_ptr, e.pdl_index, e.spc_ptr
        )?;

        writeln!(out, "spc stack (newest first):")?;
        for i in 0..8 {
            let idx = (e.spc_ptr + 32 - i) & 0o37;
            writeln!(out, "  spc[{:02o}] {:011o}", idx, e.spc[idx])?;
        }

        writeln!(out, "micro-pc history (oldest first):")?;
        for pc in e.pc_history.iter_oldest_first() {
            writeln!(out, "  {:05o}", pc)?;
        }

        writeln!(out, "macroinstruction history (oldest first):")?;
        for entry in e.lc_history.iter_oldest_first() {
            writeln!(out, "  lc {:011o} instr {:06o}", entry.lc, entry.instr)?;
        }

        dump_words(out, "m", &e.m_memory)?;
        dump_words(out, "a", &e.a_memory[..])?;
        dump_words(out, "pdl", &e.pdl[..])?;

        let l1: Vec<u32> = (0..2048).map(|i| u32::from(self.mem.l1_entry(i))).collect();
        dump_words(out, "l1", &l1)?;
        let l2: Vec<u32> = (0..1024).map(|i| self.mem.l2_entry(i)).collect();
        dump_words(out, "l2", &l2)?;
        Ok(())
    }
}

/// Dump words four per line, eliding runs of identical lines.
fn dump_words<W: Write>(out: &mut W, label: &str, words: &[u32]) -> io::Result<()> {
    let mut last: Option<[u32; 4]> = None;
    let mut elided = false;
    for (i, chunk) in words.chunks(4).enumerate() {
        let mut line = [0u32; 4];
        line[..chunk.len()].copy_from_slice(chunk);
        if Some(line) == last {
            if !elided {
                writeln!(out, "...")?;
                elided = true;
            }
            continue;
        }
        elided = false;
        last = Some(line);
        write!(out, "{label}[{:04o}]", i * 4)?;
        for w in chunk {
            write!(out, " {:011o}", w)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusDevice;
    use base::prelude::Microword;

    fn halt_word() -> Microword {
        Microword::from_bits((1 << 43) | (1 << 10))
    }

    #[test]
    fn run_returns_halted_on_a_halt_microword() {
        let mut m = Machine::new(MachineConfig::default());
        m.engine.prom[0] = halt_word();
        assert_eq!(m.run(), RunOutcome::Halted);
        assert!(m.halted());
    }

    #[test]
    fn run_honors_the_cycle_limit() {
        let mut m = Machine::new(MachineConfig {
            max_cycles: Some(100),
            ..MachineConfig::default()
        });
        // The PROM is all no-ops; nothing ever halts.
        assert_eq!(m.run(), RunOutcome::CycleLimit);
        assert_eq!(m.cycles(), 100);
    }

    #[test]
    fn halt_cycle_count_is_reproducible() {
        let count = |_| {
            let mut m = Machine::new(MachineConfig::default());
            m.engine.prom[5] = halt_word();
            m.run();
            m.cycles()
        };
        assert_eq!(count(0), count(1));
    }

    #[test]
    fn prom_disable_switches_the_fetch_path() {
        let mut m = Machine::new(MachineConfig::default());
        assert!(m.engine.prom_enabled);
        // Mode-register write as the boot microcode would do it
        // through the unibus page.
        m.bus.unibus_write(0o12, 0o44, &mut m.irq);
        m.step();
        assert!(!m.engine.prom_enabled);
    }

    #[test]
    fn mouse_events_reconcile_against_a_memory() {
        let mut m = Machine::new(MachineConfig::default());
        m.engine.write_a_mem(334, 100);
        m.engine.write_a_mem(335, 200);
        m.mouse_event(103, 198, 0);
        // dx = 3, dy = -2 land in the IOB position registers.
        assert_eq!(m.bus.iob.read_register(0o106, &mut m.irq) & 0o7777, 3);
        assert_eq!(
            m.bus.iob.read_register(0o104, &mut m.irq) & 0o7777,
            (-2i32 as u32) & 0o7777
        );
    }

    #[test]
    fn dump_state_is_well_formed() {
        let mut m = Machine::new(MachineConfig::default());
        m.engine.prom[0] = halt_word();
        m.run();
        let mut out = Vec::new();
        m.dump_state(&mut out).expect("writing to a Vec cannot fail");
        let text = String::from_utf8(out).expect("dump is ASCII");
        assert!(text.contains("cycles"));
        assert!(text.contains("spc stack"));
        assert!(text.contains("a[0000]"));
    }
}
