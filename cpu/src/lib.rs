//! This crate emulates the CADR processor: the microcode engine, the
//! two-level virtual memory map, and the XBUS/unibus peripherals.
#![crate_name = "cpu"]

pub mod bus;
mod engine;
mod history;
mod interrupt;
mod machine;
mod memory;
mod prom;

pub use bus::{BusDevice, DeviceBus, DiskController, DiskError, DiskGeometry, DiskImage};
pub use engine::{Engine, CONTROL_STORE_WORDS};
pub use history::{LcHistory, LcHistoryEntry, PcHistory};
pub use interrupt::InterruptController;
pub use machine::{Machine, MachineConfig, RunOutcome};
pub use memory::{MemoryUnit, PhysicalMemory, SnapshotError, DEFAULT_RAM_PAGES};
pub use prom::{load_prom, PromError, PROM_WORDS};
