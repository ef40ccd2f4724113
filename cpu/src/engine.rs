//! The microcode execution engine.
//!
//! The processor runs one microinstruction per cycle out of either
//! the boot PROM or the writable control store.  The pipeline is one
//! instruction deep: while `p0` executes, its successor has already
//! been fetched into `p1`, so a taken jump still executes the
//! instruction after it unless the jump's N bit inserts a bubble.
//!
//! Faults are not exceptions.  A memory access that misses the map
//! latches fault flags which the microcode inspects through jump
//! conditions 4-6 and the memory-map functional source; execution
//! always continues.

use tracing::{event, Level};

use base::prelude::{add32, rotate_left, sub32, DispatchEntry, InstructionClass, Microword};

use crate::bus::DeviceBus;
use crate::history::{LcHistory, PcHistory};
use crate::interrupt::InterruptController;
use crate::memory::MemoryUnit;
use crate::prom::PROM_WORDS;

pub const CONTROL_STORE_WORDS: usize = 16 * 1024;
const DISPATCH_WORDS: usize = 2048;

// LC flag bits.  The low 26 bits count; bits 29-26 shadow the
// interrupt-control flags; bit 31 says the next advance must fetch.
const LC_NEED_FETCH: u32 = 1 << 31;
const LC_VALUE_MASK: u32 = 0o377777777;

/// Flag set by a popped SPC entry or return address requesting that
/// LC advance as part of the return.
const SPC_ADVANCE_LC: u32 = 1 << 14;

pub struct Engine {
    pub(crate) ucode: Box<[Microword]>,
    pub(crate) prom: Box<[Microword]>,
    pub(crate) prom_enabled: bool,
    dispatch_memory: Box<[DispatchEntry]>,

    pub(crate) a_memory: Box<[u32; 1024]>,
    pub(crate) m_memory: [u32; 32],
    pub(crate) pdl: Box<[u32; 1024]>,
    pub(crate) pdl_ptr: u32,
    pub(crate) pdl_index: u32,
    pub(crate) spc: [u32; 32],
    pub(crate) spc_ptr: usize,

    pub(crate) pc: u32,
    p1: Microword,
    p0_pc: u32,
    p1_pc: u32,
    no_exec_next: bool,

    pub(crate) lc: u32,
    byte_mode: bool,
    bus_reset: bool,
    interrupt_enable: bool,
    sequence_break: bool,

    pub(crate) q: u32,
    pub(crate) vma: u32,
    pub(crate) md: u32,
    pub(crate) opc: u32,

    new_md: u32,
    new_md_delay: u32,

    alu_out: u32,
    alu_carry: bool,

    oa_lo: u32,
    oa_hi: u32,
    oa_lo_set: bool,
    oa_hi_set: bool,

    dispatch_constant: u32,

    halted: bool,
    pub(crate) cycles: u64,

    pub(crate) pc_history: PcHistory,
    pub(crate) lc_history: LcHistory,
}

impl Default for Engine {
    fn default() -> Engine {
        Engine::new()
    }
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            ucode: vec![Microword::default(); CONTROL_STORE_WORDS].into_boxed_slice(),
            prom: Box::new([Microword::default(); PROM_WORDS]),
            prom_enabled: true,
            dispatch_memory: vec![DispatchEntry::default(); DISPATCH_WORDS].into_boxed_slice(),
            a_memory: Box::new([0; 1024]),
            m_memory: [0; 32],
            pdl: Box::new([0; 1024]),
            pdl_ptr: 0,
            pdl_index: 0,
            spc: [0; 32],
            spc_ptr: 0,
            pc: 0,
            p1: Microword::default(),
            p0_pc: 0,
            p1_pc: 0,
            no_exec_next: false,
            lc: 0,
            byte_mode: false,
            bus_reset: false,
            interrupt_enable: false,
            sequence_break: false,
            q: 0,
            vma: 0,
            md: 0,
            opc: 0,
            new_md: 0,
            new_md_delay: 0,
            alu_out: 0,
            alu_carry: false,
            oa_lo: 0,
            oa_hi: 0,
            oa_lo_set: false,
            oa_hi_set: false,
            dispatch_constant: 0,
            halted: false,
            cycles: 0,
            pc_history: PcHistory::new(),
            lc_history: LcHistory::new(),
        }
    }

    pub fn halted(&self) -> bool {
        self.halted
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn read_a_mem(&self, loc: usize) -> u32 {
        self.a_memory[loc & 0o1777]
    }

    pub fn write_a_mem(&mut self, loc: usize, v: u32) {
        self.a_memory[loc & 0o1777] = v;
    }

    fn fetch(&self) -> Microword {
        let pc = (self.pc & 0o37777) as usize;
        if self.prom_enabled {
            self.prom[pc & (PROM_WORDS - 1)]
        } else {
            self.ucode[pc]
        }
    }

    fn push_spc(&mut self, v: u32) {
        self.spc_ptr = (self.spc_ptr + 1) & 0o37;
        self.spc[self.spc_ptr] = v;
    }

    fn pop_spc(&mut self) -> u32 {
        let v = self.spc[self.spc_ptr];
        self.spc_ptr = (self.spc_ptr + 0o37) & 0o37;
        v
    }

    fn write_m_mem(&mut self, loc: u32, v: u32) {
        // M-memory aliases the low A-memory slots.
        self.m_memory[(loc & 0o37) as usize] = v;
        self.a_memory[(loc & 0o37) as usize] = v;
    }

    /// Read through the map, capturing the faulting page into OPC.
    fn mem_read(
        &mut self,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
        vaddr: u32,
    ) -> Option<u32> {
        let v = mem.read_virtual(bus, irq, vaddr);
        if v.is_none() {
            self.opc = mem.fault_page;
        }
        v
    }

    fn mem_write(
        &mut self,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
        vaddr: u32,
        v: u32,
    ) -> Option<()> {
        let r = mem.write_virtual(bus, irq, vaddr, v);
        if r.is_none() {
            self.opc = mem.fault_page;
        }
        r
    }

    /// Begin a main-memory read from VMA.  The data arrives in MD
    /// two cycles later; a faulting read leaves MD untouched and the
    /// fault flags latched.
    fn start_read(
        &mut self,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) {
        if let Some(v) = self.mem_read(mem, bus, irq, self.vma) {
            self.new_md = v;
            self.new_md_delay = 2;
        }
    }

    fn start_write(
        &mut self,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) {
        let _ = self.mem_write(mem, bus, irq, self.vma, self.md);
    }

    /// Record the macroinstruction halfword LC points at.  The probe
    /// goes through the normal translation path, so the fault lines
    /// are saved and restored around it.
    fn record_lc_history(
        &mut self,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) {
        let saved = (mem.access_fault, mem.write_fault, mem.page_fault);
        let word = self.mem_read(mem, bus, irq, self.lc >> 2).unwrap_or(0);
        mem.access_fault = saved.0;
        mem.write_fault = saved.1;
        mem.page_fault = saved.2;

        let instr = if self.lc & 2 != 0 {
            (word >> 16) as u16
        } else {
            word as u16
        };
        self.lc_history.record(self.lc, instr);
    }

    /// Advance the location counter, starting the next instruction
    /// fetch when NEED-FETCH is pending.  When no fetch is needed,
    /// `pending_pc` is ORed with 2 to skip the page-fault check and
    /// SET-MD microinstructions of the return path.
    fn advance_lc(
        &mut self,
        pending_pc: Option<&mut u32>,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) {
        let old_lc = self.lc & LC_VALUE_MASK;

        self.lc = self.lc.wrapping_add(if self.byte_mode { 1 } else { 2 });

        if self.lc & LC_NEED_FETCH != 0 {
            self.lc &= !LC_NEED_FETCH;
            self.vma = old_lc >> 2;
            self.start_read(mem, bus, irq);
        } else if let Some(pc) = pending_pc {
            *pc |= 2;
        }

        // The hardware equation for "last byte in word".
        let lc0b = u32::from(self.byte_mode) & (self.lc & 1);
        let lc1 = (self.lc >> 1) & 1;
        if lc0b == 0 && lc1 == 0 {
            self.lc |= LC_NEED_FETCH;
        }

        self.record_lc_history(mem, bus, irq);
    }

    /// Position field, possibly modified by LC for the instruction
    /// stream dispatch/byte forms (misc function 3).
    fn tweaked_position(&self, u: Microword) -> u32 {
        if self.byte_mode {
            let ir4 = u.ir_bit(4);
            let ir3 = u.ir_bit(3);
            let lc1 = (self.lc >> 1) & 1;
            let lc0 = self.lc & 1;
            ((u.bits() & 0o7) as u32) | ((ir4 ^ (lc1 ^ lc0)) << 4) | ((ir3 ^ lc0) << 3)
        } else {
            let ir4 = u.ir_bit(4);
            let lc1 = (self.lc >> 1) & 1;
            ((u.bits() & 0o17) as u32) | (u32::from((ir4 ^ lc1) == 0) << 4)
        }
    }

    fn m_source_value(&mut self, u: Microword, mem: &mut MemoryUnit) -> u32 {
        let m_src = u.m_src();
        if m_src & 0o40 == 0 {
            return self.m_memory[(m_src & 0o37) as usize];
        }
        // Functional sources.
        match m_src & 0o37 {
            0 => self.dispatch_constant,
            1 => ((self.spc_ptr as u32) << 24) | (self.spc[self.spc_ptr] & 0o1777777),
            2 => self.pdl_ptr & 0o1777,
            3 => self.pdl_index & 0o1777,
            5 => self.pdl[(self.pdl_index & 0o1777) as usize],
            6 => self.opc,
            7 => self.q,
            0o10 => self.vma,
            0o11 => {
                // Memory map contents for the page MD names.
                let t = mem.map_vtop(self.md);
                (u32::from(mem.write_fault) << 31)
                    | (u32::from(mem.access_fault) << 30)
                    | ((t.l1 & 0o37) << 24)
                    | (t.l2 & 0o77777777)
            }
            0o12 => self.md,
            0o13 => {
                if self.byte_mode {
                    self.lc
                } else {
                    self.lc & !1
                }
            }
            0o14 => {
                // SPC pointer and data, pop.
                let v = ((self.spc_ptr as u32) << 24) | (self.spc[self.spc_ptr] & 0o1777777);
                self.spc_ptr = (self.spc_ptr + 0o37) & 0o37;
                v
            }
            0o24 => {
                let v = self.pdl[(self.pdl_ptr & 0o1777) as usize];
                self.pdl_ptr = (self.pdl_ptr + 0o1777) & 0o1777;
                v
            }
            0o25 => self.pdl[(self.pdl_ptr & 0o1777) as usize],
            _ => 0,
        }
    }

    /// Write the output bus to a decoded destination.  Every write
    /// also lands in M-memory (and its A-memory alias) at the low
    /// five destination bits, unless bit 11 selects a direct
    /// A-memory write.
    fn write_dest(
        &mut self,
        dest: u32,
        out_bus: u32,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) {
        if dest & 0o4000 != 0 {
            self.a_memory[(dest & 0o3777) as usize] = out_bus;
            return;
        }

        match dest >> 5 {
            1 => {
                // LC, 26 bits.
                event!(Level::TRACE, "lc <- {:o}", out_bus);
                self.lc = (self.lc & !LC_VALUE_MASK) | (out_bus & LC_VALUE_MASK);
                if !self.byte_mode {
                    // In halfword mode the low order bit is ignored.
                    self.lc &= !1;
                }
                self.lc |= LC_NEED_FETCH;
                self.record_lc_history(mem, bus, irq);
            }
            2 => {
                // Interrupt control, bits 29-26.
                self.byte_mode = out_bus & (1 << 29) != 0;
                self.bus_reset = out_bus & (1 << 28) != 0;
                self.interrupt_enable = out_bus & (1 << 27) != 0;
                self.sequence_break = out_bus & (1 << 26) != 0;

                if self.sequence_break {
                    event!(Level::DEBUG, "ic: sequence break request");
                }
                if self.interrupt_enable {
                    event!(Level::DEBUG, "ic: interrupt enable");
                }
                if self.bus_reset {
                    event!(Level::DEBUG, "ic: bus reset");
                }
                if self.byte_mode {
                    event!(Level::DEBUG, "ic: lc byte mode");
                }

                // The flags shadow into the LC flag nibble.
                self.lc = (self.lc & !(0o17 << 26)) | (out_bus & (0o17 << 26));
            }
            0o10 => {
                self.pdl[(self.pdl_ptr & 0o1777) as usize] = out_bus;
            }
            0o11 => {
                self.pdl_ptr = (self.pdl_ptr + 1) & 0o1777;
                self.pdl[(self.pdl_ptr & 0o1777) as usize] = out_bus;
            }
            0o12 => {
                self.pdl[(self.pdl_index & 0o1777) as usize] = out_bus;
            }
            0o13 => self.pdl_index = out_bus & 0o1777,
            0o14 => self.pdl_ptr = out_bus & 0o1777,
            0o15 => self.push_spc(out_bus),
            0o16 => {
                // Next instruction modifier, low half.
                self.oa_lo = out_bus & 0o377777777;
                self.oa_lo_set = true;
            }
            0o17 => {
                self.oa_hi = out_bus;
                self.oa_hi_set = true;
            }
            0o20 => self.vma = out_bus,
            0o21 => {
                self.vma = out_bus;
                self.start_read(mem, bus, irq);
            }
            0o22 => {
                self.vma = out_bus;
                self.start_write(mem, bus, irq);
            }
            0o23 => {
                self.vma = out_bus;
                mem.write_map(self.vma, self.md);
            }
            0o30 => self.md = out_bus,
            0o31 => {
                self.md = out_bus;
                self.start_read(mem, bus, irq);
            }
            0o32 => {
                self.md = out_bus;
                self.start_write(mem, bus, irq);
            }
            0o33 => {
                self.md = out_bus;
                mem.write_map(self.vma, self.md);
            }
            _ => {}
        }

        self.write_m_mem(dest & 0o37, out_bus);
    }

    fn set_alu_wide(&mut self, lv: i64) {
        self.alu_out = lv as u32;
        self.alu_carry = (lv >> 32) != 0;
    }

    fn set_alu_add(&mut self, a: u32, b: u32, carry_in: bool) {
        let (out, carry) = add32(a, b, carry_in);
        self.alu_out = out;
        self.alu_carry = carry;
    }

    fn set_alu_sub(&mut self, a: u32, b: u32, carry_in: bool) {
        let (out, carry) = sub32(a, b, carry_in);
        self.alu_out = out;
        self.alu_carry = carry;
    }

    fn execute_alu(
        &mut self,
        u: Microword,
        a: u32,
        m: u32,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) {
        let ci = u.carry_in();

        self.alu_carry = false;

        match u.alu_op() {
            // Boolean.
            0o00 => self.alu_out = 0,
            0o01 => self.alu_out = m & a,
            0o02 => self.alu_out = m & !a,
            0o03 => self.alu_out = m,
            0o04 => self.alu_out = !m & a,
            0o05 => self.alu_out = a,
            0o06 => self.alu_out = m ^ a,
            0o07 => self.alu_out = m | a,
            0o10 => self.alu_out = !a & !m,
            0o11 => self.alu_out = u32::from(a == m),
            0o12 => self.alu_out = !a,
            0o13 => self.alu_out = m | !a,
            0o14 => self.alu_out = !m,
            0o15 => self.alu_out = !m | a,
            0o16 => self.alu_out = !m | !a,
            0o17 => self.alu_out = !0,

            // Arithmetic.  The oddball function codes come straight
            // from the 74181's table; the 64-bit intermediate keeps
            // the carry exact.
            0o20 => self.alu_out = if ci { 0 } else { !0 },
            0o21 => self.set_alu_wide(i64::from((m & a) as i32) - i64::from(!ci)),
            0o22 => self.set_alu_wide(i64::from((m & !a) as i32) - i64::from(!ci)),
            0o23 => self.set_alu_wide(i64::from(m as i32) - i64::from(!ci)),
            0o24 => self.set_alu_wide(i64::from((m | !a) as i32) + i64::from(ci)),
            0o25 => self.set_alu_wide(
                i64::from((m | !a) as i32) + i64::from((m & a) as i32) + i64::from(ci),
            ),
            0o26 => self.set_alu_sub(m, a, ci),
            0o27 => {
                self.set_alu_wide(i64::from((m | !a) as i32) + i64::from(m as i32) + i64::from(ci))
            }
            0o30 => self.set_alu_wide(i64::from((m | a) as i32) + i64::from(ci)),
            0o31 => self.set_alu_add(m, a, ci),
            0o32 => self.set_alu_wide(
                i64::from((m | a) as i32) + i64::from((m & !a) as i32) + i64::from(ci),
            ),
            0o33 => {
                self.set_alu_wide(i64::from((m | a) as i32) + i64::from(m as i32) + i64::from(ci))
            }
            0o34 => {
                self.alu_out = m.wrapping_add(u32::from(ci));
                self.alu_carry = m == 0xffff_ffff && ci;
            }
            0o35 => {
                self.set_alu_wide(i64::from(m as i32) + i64::from((m & a) as i32) + i64::from(ci))
            }
            0o36 => {
                self.set_alu_wide(i64::from(m as i32) + i64::from((m | !a) as i32) + i64::from(ci))
            }
            0o37 => self.set_alu_add(m, m, ci),

            // Conditioned on Q's low bit.
            0o40 => {
                // Multiply step.
                if self.q & 1 != 0 {
                    self.set_alu_add(a, m, ci);
                } else {
                    self.alu_out = m;
                    self.alu_carry = m & 0x8000_0000 != 0;
                }
            }
            0o41 => {
                // Divide step.
                if self.q & 1 != 0 {
                    self.set_alu_sub(m, a, !ci);
                } else {
                    self.set_alu_add(m, a, ci);
                }
            }
            0o45 => {
                // Remainder correction; keeps the previous ALU output
                // when Q's low bit is set.
                if self.q & 1 != 0 {
                    self.alu_carry = false;
                } else {
                    let prev = self.alu_out;
                    self.set_alu_add(prev, a, ci);
                }
            }
            0o51 => {
                // Initial divide step.
                self.set_alu_sub(m, a, !ci);
            }
            other => {
                event!(Level::WARN, "unhandled alu function {:o}", other);
            }
        }

        // Q register control.
        let old_q = self.q;
        match u.q_control() {
            1 => {
                // Shift left, inverse of the ALU sign shifting in.
                self.q <<= 1;
                if self.alu_out & 0x8000_0000 == 0 {
                    self.q |= 1;
                }
            }
            2 => {
                self.q >>= 1;
                if self.alu_out & 1 != 0 {
                    self.q |= 0x8000_0000;
                }
            }
            3 => self.q = self.alu_out,
            _ => {}
        }

        // Output bus selector.
        let out_bus = match u.output_selector() {
            1 => self.alu_out,
            2 => {
                // ALU output shifted right one, with the correct sign
                // shifted in, regardless of overflow.
                (self.alu_out >> 1) | if self.alu_carry { 0x8000_0000 } else { 0 }
            }
            3 => (self.alu_out << 1) | ((old_q >> 31) & 1),
            _ => {
                event!(Level::WARN, "alu output selector 0");
                rotate_left(m, u.position())
            }
        };

        self.write_dest(u.dest(), out_bus, mem, bus, irq);
    }

    /// Final stage of a taken jump, shared by the JUMP and DISPATCH
    /// classes: push the return address, pop a return target, insert
    /// the pipeline bubble, move the micro-PC.
    fn finish_jump(
        &mut self,
        target: u32,
        n: bool,
        p: bool,
        r: bool,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) {
        let mut new_pc = target;

        if p {
            let ret = if n { self.pc.wrapping_sub(1) } else { self.pc };
            self.push_spc(ret);
        }

        if r {
            new_pc = self.pop_spc();
            if new_pc & SPC_ADVANCE_LC != 0 {
                let mut pc = new_pc;
                self.advance_lc(Some(&mut pc), mem, bus, irq);
                new_pc = pc;
            }
            new_pc &= 0o37777;
        }

        if n {
            self.no_exec_next = true;
        }
        self.pc = new_pc;
    }

    /// Execute a JUMP-class instruction; true when the jump was
    /// taken (which also inhibits POPJ).
    fn execute_jump(
        &mut self,
        u: Microword,
        a: u32,
        m: u32,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) -> bool {
        if u.misc() == 3 {
            event!(Level::WARN, "jump with misc function 3");
        }

        let mut m = m;
        let mut take = if u.condition_from_table() {
            match u.condition_code() {
                0 => {
                    event!(Level::WARN, "jump condition 0 at pc {:o}", self.p0_pc);
                    false
                }
                1 => (m as i32) < (a as i32),
                2 => (m as i32) <= (a as i32),
                3 => m == a,
                4 => mem.page_fault,
                5 => mem.page_fault || (self.interrupt_enable && irq.pending()),
                6 => {
                    mem.page_fault
                        || (self.interrupt_enable && irq.pending())
                        || self.sequence_break
                }
                7 => true,
                _ => false,
            }
        } else {
            // The rotation sticks: a P&R control-store write stores
            // the rotated value.
            m = rotate_left(m, u.position());
            m & 1 != 0
        };

        if u.invert_sense() {
            take = !take;
        }

        // P and R together on a jump write the control store.
        if u.p_bit() && u.r_bit() {
            let w = (u64::from(a & 0o177777) << 32) | u64::from(m);
            event!(
                Level::DEBUG,
                "control store write {:o} @ {:o}",
                w,
                u.jump_target()
            );
            self.ucode[u.jump_target() as usize] = Microword::from_bits(w);
        }

        if take {
            self.finish_jump(u.jump_target(), u.n_bit(), u.p_bit(), u.r_bit(), mem, bus, irq);
        }
        take
    }

    /// Execute a DISPATCH-class instruction; true when it jumped.
    fn execute_dispatch(
        &mut self,
        u: Microword,
        a: u32,
        m: u32,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) -> bool {
        let mut pos = u.position();
        if u.misc() == 3 {
            pos = self.tweaked_position(u);
        }

        // Misc function 2 writes dispatch memory instead of
        // dispatching.
        if u.misc() == 2 {
            let base = (u.dispatch_base() & 0o3777) as usize;
            event!(Level::DEBUG, "dispatch_memory[{:o}] <- {:o}", base, a);
            self.dispatch_memory[base] = DispatchEntry::from_bits(a);
            return false;
        }

        let rotated = rotate_left(m, pos);
        let len = u.dispatch_width();
        let mask = if len == 0 {
            0
        } else {
            !0u32 >> (31 - ((len - 1) & 0o37))
        };

        let mut disp_addr = u.dispatch_base() | (rotated & mask);

        // Perturb the address with L2 map bits for the page MD names.
        let map = u.dispatch_map_select();
        if map != 0 {
            let l2 = mem.map_vtop(self.md).l2;
            let bit18 = (l2 >> 18) & 1;
            let bit19 = (l2 >> 19) & 1;
            disp_addr |= match map {
                1 => bit18,
                2 => bit19,
                _ => bit18 | bit19,
            };
        }
        disp_addr &= 0o3777;

        let entry = self.dispatch_memory[disp_addr as usize];
        event!(Level::TRACE, "dispatch[{:o}] -> {:o}", disp_addr, entry.bits());

        self.dispatch_constant = u.dispatch_constant();

        if u.dispatch_n_plus1() && entry.n_bit() {
            self.pc = self.pc.wrapping_sub(1);
        }

        if u.dispatch_advance_lc() {
            self.advance_lc(None, mem, bus, irq);
        }

        // P and R together mean fall through without jumping.
        if entry.p_bit() && entry.r_bit() {
            if entry.n_bit() {
                self.no_exec_next = true;
            }
            return false;
        }

        self.finish_jump(
            entry.target(),
            entry.n_bit(),
            entry.p_bit(),
            entry.r_bit(),
            mem,
            bus,
            irq,
        );
        true
    }

    fn execute_byte(
        &mut self,
        u: Microword,
        a: u32,
        m: u32,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) {
        let function = u.byte_function();
        let widthm1 = u.byte_width_m1();
        let mut pos = u.position();
        if u.misc() == 3 {
            pos = self.tweaked_position(u);
        }

        let right_mask_index = if function & 2 != 0 { pos } else { 0 };
        let left_mask_index = (right_mask_index + widthm1) & 0o37;

        let left_mask = !0u32 >> (31 - left_mask_index);
        let right_mask = !0u32 << right_mask_index;
        let mask = left_mask & right_mask;

        let out_bus = match function {
            // Load byte and deposit byte differ only in where the
            // mask sits; both rotate M into place first.
            1 | 3 => (rotate_left(m, pos) & mask) | (a & !mask),
            // Selective deposit.
            2 => (m & mask) | (a & !mask),
            _ => {
                event!(Level::WARN, "byte function 0");
                0
            }
        };

        self.write_dest(u.dest(), out_bus, mem, bus, irq);
    }

    /// Run one pipeline cycle.
    pub fn step(
        &mut self,
        mem: &mut MemoryUnit,
        bus: &mut DeviceBus,
        irq: &mut InterruptController,
    ) {
        self.cycles = self.cycles.wrapping_add(1);
        if self.cycles == 0 {
            self.cycles = 1;
        }

        let mut u = self.p1;
        self.p0_pc = self.p1_pc;
        self.p1 = self.fetch();
        self.p1_pc = self.pc;
        self.pc = (self.pc + 1) & 0o37777;

        if self.new_md_delay > 0 {
            self.new_md_delay -= 1;
            if self.new_md_delay == 0 {
                self.md = self.new_md;
            }
        }

        // A pending bubble discards the already-fetched instruction.
        if self.no_exec_next {
            event!(Level::TRACE, "pipeline bubble; pc {:o}", self.pc);
            self.no_exec_next = false;

            u = self.p1;
            self.p0_pc = self.p1_pc;
            self.p1 = self.fetch();
            self.p1_pc = self.pc;
            self.pc = (self.pc + 1) & 0o37777;
        }

        // Next instruction modify.
        if self.oa_lo_set {
            event!(Level::TRACE, "merging oa lo {:o}", self.oa_lo);
            self.oa_lo_set = false;
            u = u.merged_with(u64::from(self.oa_lo));
        }
        if self.oa_hi_set {
            event!(Level::TRACE, "merging oa hi {:o}", self.oa_hi);
            self.oa_hi_set = false;
            u = u.merged_with(u64::from(self.oa_hi) << 26);
        }

        self.pc_history.record(self.p0_pc);

        if u.is_nop() {
            return;
        }

        let mut popj = u.popj();
        let a_value = self.a_memory[u.a_src()];
        let m_value = self.m_source_value(u, mem);

        match u.class() {
            InstructionClass::Alu => self.execute_alu(u, a_value, m_value, mem, bus, irq),
            InstructionClass::Jump => {
                if u.misc() == 1 {
                    event!(Level::INFO, "halted at pc {:o}", self.p0_pc);
                    self.halted = true;
                } else if self.execute_jump(u, a_value, m_value, mem, bus, irq) {
                    popj = false;
                }
            }
            InstructionClass::Dispatch => {
                if self.execute_dispatch(u, a_value, m_value, mem, bus, irq) {
                    popj = false;
                }
            }
            InstructionClass::Byte => self.execute_byte(u, a_value, m_value, mem, bus, irq),
        }

        if popj {
            let mut new_pc = self.pop_spc();
            if new_pc & SPC_ADVANCE_LC != 0 {
                let mut pc = new_pc;
                self.advance_lc(Some(&mut pc), mem, bus, irq);
                new_pc = pc;
            }
            self.pc = new_pc & 0o37777;
        }
    }
}
