//! ELF Binary Loader
//!
//! Loads statically linked i386 executables into a process address space.
//!
//! # Stages
//!
//! 1. [`elf`] parses and validates the header and program header table
//! 2. [`segment_loader`] maps each `PT_LOAD` segment and copies its bytes
//! 3. [`program`] publishes the startup block and lays out argc/argv/envp/auxv
//!
//! Control transfer lives in [`crate::process`].

pub mod elf;
pub mod program;
pub mod segment_loader;

pub use elf::{Elf32Header, Elf32Loader, Elf32ProgramHeader, FormatError, ParsedImage};
pub use program::{CapacityError, StartupBlock, StartupStack};
pub use segment_loader::{load_segments, LoadResult};

use crate::memory::MapError;
use crate::vfs::VfsError;

/// Errors from loading an image into an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// Image rejected before any state was touched
    Format(FormatError),
    /// Memory manager refused a required mapping
    Map(MapError),
    /// Startup stack does not fit the stack region
    Capacity(CapacityError),
    /// Opening or reading the image failed
    Io(VfsError),
}

impl From<FormatError> for LoadError {
    fn from(e: FormatError) -> Self {
        LoadError::Format(e)
    }
}

impl From<MapError> for LoadError {
    fn from(e: MapError) -> Self {
        LoadError::Map(e)
    }
}

impl From<CapacityError> for LoadError {
    fn from(e: CapacityError) -> Self {
        LoadError::Capacity(e)
    }
}

impl From<VfsError> for LoadError {
    fn from(e: VfsError) -> Self {
        LoadError::Io(e)
    }
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Format(e) => write!(f, "Format error: {}", e),
            Self::Map(e) => write!(f, "Map error: {}", e),
            Self::Capacity(e) => write!(f, "Capacity error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}
