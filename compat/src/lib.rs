//! KPIO Linux Binary Compatibility: Exec Loader
//!
//! Loads statically linked Linux i386 ELF executables into a process
//! address space and hands control to them.
//!
//! # Architecture
//!
//! ```text
//!   sys_execve / launch
//!          │
//!   ┌──────▼───────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!   │ loader::elf  │──▶│ segment      │──▶│ loader::     │──▶│ process::    │
//!   │ (parse)      │   │ loader (map) │   │ program      │   │ transfer     │
//!   └──────────────┘   └──────────────┘   │ (stack/auxv) │   │ (cold/live)  │
//!                                         └──────────────┘   └──────────────┘
//! ```
//!
//! The memory manager, the VFS, the process table and the trap front end
//! are collaborators reached through the traits in [`memory`], [`vfs`] and
//! [`process::table`]. Page size and stack region are passed explicitly;
//! nothing in this crate reads global state.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod loader;
pub mod memory;
pub mod process;
pub mod syscall;
pub mod vfs;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod tests;

pub use config::LoaderConfig;
pub use loader::{LoadError, LoadResult};
pub use process::exec::{ExecError, LaunchPlan, Loader};
pub use process::{InitialRegisterState, TrapContext, TrapHandoff};
