//! Process Image Replacement
//!
//! Register state, the process-table contract, control transfer into a new
//! image and the exec orchestrator that ties the loader stages together.

pub mod context;
pub mod exec;
pub mod table;
pub mod transfer;

pub use context::{InitialRegisterState, Register, TrapContext, TrapHandoff};
pub use exec::{ExecError, LaunchPlan, Loader};
pub use table::{ProcessTable, StackRegion};
pub use transfer::{transfer_cold, transfer_live, EntryTrampoline};

#[cfg(target_arch = "x86")]
pub use transfer::NativeEntry;
