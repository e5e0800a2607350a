//! Processes
//!
//! The process control block, the intrusive PCB queue used by the
//! scheduler and every synchronization object, and the process table that
//! owns all live PCBs.

pub mod pcb;
pub mod queue;
pub mod table;

pub use pcb::{Pcb, PendingRead, Pid, ProcessState, StagedBytes};
pub use queue::PcbQueue;
pub use table::ProcessTable;
