//! Process Table contract
//!
//! The process table owns each process's stack region. The loader only
//! asks where the region is and writes the startup stack into it.

/// A process's pre-allocated stack region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    /// Lowest address of the region
    pub base: u32,
    /// Region length in bytes
    pub size: u32,
}

impl StackRegion {
    /// One past the highest address, up to `1 << 32`. The stack grows
    /// down from here.
    pub const fn top(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    /// Check if `addr` lies inside the region.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr as u64) < self.top()
    }
}

/// View of the calling process held by the process table.
pub trait ProcessTable {
    /// Stack region of the calling process.
    fn stack_region(&self) -> StackRegion;

    /// Bytes of the stack region, `stack_region().size` long.
    fn stack_memory_mut(&mut self) -> &mut [u8];
}
