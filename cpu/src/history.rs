//! Diagnostic history rings: the last few micro-PCs executed and the
//! last few macroinstructions fetched.  Both feed the state dump.

const PC_HISTORY_LEN: usize = 64;
const LC_HISTORY_LEN: usize = 200;

/// Ring of recently executed micro-PCs.
pub struct PcHistory {
    entries: [u32; PC_HISTORY_LEN],
    head: usize,
}

impl Default for PcHistory {
    fn default() -> PcHistory {
        PcHistory::new()
    }
}

impl PcHistory {
    pub fn new() -> PcHistory {
        PcHistory {
            entries: [0; PC_HISTORY_LEN],
            head: 0,
        }
    }

    pub fn record(&mut self, pc: u32) {
        self.entries[self.head] = pc;
        self.head = (self.head + 1) % PC_HISTORY_LEN;
    }

    /// The most recently recorded micro-PC.
    pub fn latest(&self) -> u32 {
        self.entries[(self.head + PC_HISTORY_LEN - 1) % PC_HISTORY_LEN]
    }

    /// Entries oldest first; location 0 marks unused slots.
    pub fn iter_oldest_first(&self) -> impl Iterator<Item = u32> + '_ {
        let head = self.head;
        (0..PC_HISTORY_LEN)
            .map(move |i| self.entries[(head + i) % PC_HISTORY_LEN])
            .filter(|pc| *pc != 0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LcHistoryEntry {
    pub lc: u32,
    pub instr: u16,
}

/// Ring of recently fetched macroinstruction halfwords, recorded on
/// every LC change.
pub struct LcHistory {
    entries: [LcHistoryEntry; LC_HISTORY_LEN],
    head: usize,
}

impl Default for LcHistory {
    fn default() -> LcHistory {
        LcHistory::new()
    }
}

impl LcHistory {
    pub fn new() -> LcHistory {
        LcHistory {
            entries: [LcHistoryEntry::default(); LC_HISTORY_LEN],
            head: 0,
        }
    }

    pub fn record(&mut self, lc: u32, instr: u16) {
        self.entries[self.head] = LcHistoryEntry { lc, instr };
        self.head = (self.head + 1) % LC_HISTORY_LEN;
    }

    pub fn iter_oldest_first(&self) -> impl Iterator<Item = LcHistoryEntry> + '_ {
        let head = self.head;
        (0..LC_HISTORY_LEN)
            .map(move |i| self.entries[(head + i) % LC_HISTORY_LEN])
            .filter(|e| e.lc != 0 || e.instr != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc_history_wraps() {
        let mut h = PcHistory::new();
        for pc in 1..=70u32 {
            h.record(pc);
        }
        assert_eq!(h.latest(), 70);
        let entries: Vec<u32> = h.iter_oldest_first().collect();
        assert_eq!(entries.len(), PC_HISTORY_LEN);
        assert_eq!(entries[0], 7); // 64 most recent of 70
        assert_eq!(entries[63], 70);
    }

    #[test]
    fn empty_slots_are_skipped() {
        let mut h = PcHistory::new();
        h.record(0o123);
        h.record(0o456);
        let entries: Vec<u32> = h.iter_oldest_first().collect();
        assert_eq!(entries, vec![0o123, 0o456]);
    }

    #[test]
    fn lc_history_keeps_lc_and_instr() {
        let mut h = LcHistory::new();
        h.record(0o1000, 0o123);
        h.record(0o1002, 0o456);
        let entries: Vec<LcHistoryEntry> = h.iter_oldest_first().collect();
        assert_eq!(
            entries,
            vec![
                LcHistoryEntry { lc: 0o1000, instr: 0o123 },
                LcHistoryEntry { lc: 0o1002, instr: 0o456 },
            ]
        );
    }
}
