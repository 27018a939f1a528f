//! Memory manager contract.
//!
//! The loader never touches page tables itself. It asks the process's
//! memory manager for mappings, for a window onto guest memory and for
//! heap-break updates.

use bitflags::bitflags;

bitflags! {
    /// Mapping protection (Linux PROT_* values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        /// Pages may be read.
        const READ = 0x1;
        /// Pages may be written.
        const WRITE = 0x2;
        /// Pages may be executed.
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Mapping flags (Linux MAP_* values).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Private copy-on-write mapping.
        const PRIVATE = 0x02;
        /// Place the mapping exactly at the requested address.
        const FIXED = 0x10;
        /// Not backed by a file; pages start zeroed.
        const ANONYMOUS = 0x20;
    }
}

/// A single mapping request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    /// Requested start address (a hint unless `FIXED`).
    pub addr: u32,
    /// Length in bytes.
    pub size: u32,
    /// Page protection.
    pub prot: Protection,
    /// Mapping flags.
    pub flags: MapFlags,
    /// Backing descriptor, `None` for anonymous memory.
    pub backing: Option<i32>,
    /// Offset into the backing descriptor.
    pub offset: u32,
}

impl MapRequest {
    /// Zero-filled private mapping at exactly `addr`.
    pub const fn fixed_anonymous(addr: u32, size: u32, prot: Protection) -> Self {
        Self {
            addr,
            size,
            prot,
            flags: MapFlags::from_bits_truncate(
                MapFlags::FIXED.bits() | MapFlags::ANONYMOUS.bits() | MapFlags::PRIVATE.bits(),
            ),
            backing: None,
            offset: 0,
        }
    }

    /// Zero-filled private mapping wherever the memory manager sees fit.
    pub const fn anonymous(size: u32, prot: Protection) -> Self {
        Self {
            addr: 0,
            size,
            prot,
            flags: MapFlags::from_bits_truncate(
                MapFlags::ANONYMOUS.bits() | MapFlags::PRIVATE.bits(),
            ),
            backing: None,
            offset: 0,
        }
    }
}

/// Memory manager failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The requested range is unavailable (reserved or outside user space).
    Rejected { addr: u32, size: u32 },
    /// No physical memory left.
    OutOfMemory,
    /// Address arithmetic wrapped past the end of the address space.
    InvalidRange,
    /// Access to guest memory that is not mapped.
    Unmapped { addr: u32, len: u32 },
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Rejected { addr, size } => {
                write!(f, "Mapping rejected at {:#x} ({:#x} bytes)", addr, size)
            }
            Self::OutOfMemory => write!(f, "Out of memory"),
            Self::InvalidRange => write!(f, "Invalid address range"),
            Self::Unmapped { addr, len } => {
                write!(f, "Unmapped guest memory at {:#x} ({} bytes)", addr, len)
            }
        }
    }
}

/// Per-process memory manager.
///
/// Calls are synchronous: the loader waits for each answer before issuing
/// the next request.
pub trait MemoryManager {
    /// Create a mapping and return its start address.
    fn map(&mut self, request: MapRequest) -> Result<u32, MapError>;

    /// Change protection of an existing range.
    fn protect(&mut self, addr: u32, size: u32, prot: Protection) -> Result<(), MapError>;

    /// Read-only window onto mapped guest memory.
    fn memory(&self, addr: u32, len: u32) -> Option<&[u8]>;

    /// Writable window onto mapped guest memory.
    ///
    /// The window ignores page protection; it is the kernel's view.
    fn memory_mut(&mut self, addr: u32, len: u32) -> Option<&mut [u8]>;

    /// Current heap break.
    fn brk(&self) -> u32;

    /// Set the heap break.
    fn update_brk(&mut self, addr: u32);

    /// Tear down the whole address space (used before exec).
    fn reset(&mut self);
}

/// Copy `data` into guest memory at `addr`.
pub fn copy_to_guest<M: MemoryManager + ?Sized>(
    mm: &mut M,
    addr: u32,
    data: &[u8],
) -> Result<(), MapError> {
    let len = data.len() as u32;
    let window = mm
        .memory_mut(addr, len)
        .ok_or(MapError::Unmapped { addr, len })?;
    window.copy_from_slice(data);
    Ok(())
}

/// Read one little-endian word from guest memory.
pub fn read_guest_word<M: MemoryManager + ?Sized>(mm: &M, addr: u32) -> Option<u32> {
    let bytes = mm.memory(addr, 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
