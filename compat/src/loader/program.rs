//! Startup Image
//!
//! Builds what the guest C runtime expects to find when it starts:
//!
//! - the *startup block*, one anonymous mapping holding the program header
//!   table and the argv/envp strings the stack points into
//! - the *startup stack*, the word array at the top of the stack region
//!
//! # Stack Layout (i386 SysV ABI)
//!
//! ```text
//!   (high address = region top)
//!   +-------------------+
//!   | 0                 | ← end of auxv
//!   | AT_ENTRY, e_entry |
//!   | AT_FLAGS, 0       |
//!   | AT_BASE, 0        |
//!   | AT_PAGESZ, page   |
//!   | AT_PHNUM, phnum   |
//!   | AT_PHENT, phent   |
//!   | AT_PHDR, phdr     |
//!   +-------------------+
//!   | 0                 | ← end of envp
//!   | envp[n] ptr       |
//!   | ...               |
//!   +-------------------+
//!   | 0                 | ← end of argv
//!   | argv[n] ptr       |
//!   | ...               |
//!   +-------------------+
//!   | argc              | ← ESP points here
//!   +-------------------+
//!   | (reserved word)   | ← ENTRY_RESERVE
//!   +-------------------+
//!   (low address)
//! ```

use alloc::vec::Vec;

use super::elf::{Elf32Header, ProgramHeaderTable};
use crate::config::{LoaderConfig, WORD_SIZE};
use crate::memory::{copy_to_guest, MapError, MapRequest, MemoryManager, Protection};
use crate::process::table::{ProcessTable, StackRegion};

/// Auxiliary vector entry types
pub mod auxv {
    /// End of auxiliary vector
    pub const AT_NULL: u32 = 0;
    /// Program headers location
    pub const AT_PHDR: u32 = 3;
    /// Size of program header entry
    pub const AT_PHENT: u32 = 4;
    /// Number of program headers
    pub const AT_PHNUM: u32 = 5;
    /// Page size
    pub const AT_PAGESZ: u32 = 6;
    /// Base address of interpreter
    pub const AT_BASE: u32 = 7;
    /// Flags
    pub const AT_FLAGS: u32 = 8;
    /// Program entry point
    pub const AT_ENTRY: u32 = 9;

    /// Keys every startup stack carries, in the order they are written.
    pub const REQUIRED: [u32; 7] = [
        AT_PHDR, AT_PHENT, AT_PHNUM, AT_PAGESZ, AT_BASE, AT_FLAGS, AT_ENTRY,
    ];
}

/// Number of auxv (key, value) pairs before the terminator.
pub const AUXV_ENTRIES: usize = auxv::REQUIRED.len();

/// Bytes kept free below the argc slot. The native entry path pushes the
/// entry point there before its final `ret`.
pub const ENTRY_RESERVE: usize = WORD_SIZE as usize;

/// The stack region cannot hold the startup stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError {
    /// Bytes the startup stack needs
    pub needed: usize,
    /// Bytes the region provides
    pub available: usize,
}

impl core::fmt::Display for CapacityError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Startup stack needs {} bytes, region holds {}",
            self.needed, self.available
        )
    }
}

/// Loader-owned guest memory holding the program header table and the
/// argument strings.
///
/// The mapping belongs to the process address space and is released with
/// it by [`MemoryManager::reset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupBlock {
    /// Mapping start
    pub base: u32,
    /// Mapping length
    pub size: u32,
    /// Guest address of the program header table (`AT_PHDR`)
    pub phdr_addr: u32,
    /// Guest addresses of the argv strings
    pub argv: Vec<u32>,
    /// Guest addresses of the envp strings
    pub envp: Vec<u32>,
}

impl StartupBlock {
    /// Map the block and copy the table and strings into it.
    pub fn publish<M, A, E>(
        mm: &mut M,
        phdrs: &ProgramHeaderTable,
        args: &[A],
        envp: &[E],
        config: &LoaderConfig,
    ) -> Result<Self, MapError>
    where
        M: MemoryManager + ?Sized,
        A: AsRef<[u8]>,
        E: AsRef<[u8]>,
    {
        let table_len = align_up(phdrs.byte_len(), WORD_SIZE as usize);
        let strings_len: usize = args
            .iter()
            .map(|a| a.as_ref().len() + 1)
            .chain(envp.iter().map(|e| e.as_ref().len() + 1))
            .sum();

        let page = config.page_size as usize;
        let size = align_up((table_len + strings_len).max(1), page);
        let size = u32::try_from(size).map_err(|_| MapError::InvalidRange)?;

        let base = mm.map(MapRequest::anonymous(
            size,
            Protection::READ | Protection::WRITE,
        ))?;

        copy_to_guest(mm, base, phdrs.as_bytes())?;

        let mut cursor = base + table_len as u32;
        let mut place = |mm: &mut M, s: &[u8]| -> Result<u32, MapError> {
            let at = cursor;
            copy_to_guest(mm, at, s)?;
            copy_to_guest(mm, at + s.len() as u32, &[0])?;
            cursor += s.len() as u32 + 1;
            Ok(at)
        };

        let argv = args
            .iter()
            .map(|a| place(&mut *mm, a.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = envp
            .iter()
            .map(|e| place(&mut *mm, e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "[KPIO/Exec] Startup block at {:#x}+{:#x}: phdr={:#x}, {} args, {} env",
            base,
            size,
            base,
            argv.len(),
            envp.len()
        );

        Ok(Self {
            base,
            size,
            phdr_addr: base,
            argv,
            envp,
        })
    }
}

/// The startup stack, computed but not yet written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupStack {
    /// Initial stack pointer (address of the argc slot)
    pub top: u32,
    /// Slots from `top` upwards
    pub words: Vec<u32>,
}

impl StartupStack {
    /// Number of word slots for `argc` arguments and `envc` variables:
    /// argc, argv + NULL, envp + NULL, auxv pairs, AT_NULL.
    pub const fn slot_count(argc: usize, envc: usize) -> usize {
        1 + argc + 1 + envc + 1 + AUXV_ENTRIES * 2 + 1
    }

    /// Bytes the stack region must provide: every slot plus
    /// [`ENTRY_RESERVE`] below the argc slot.
    pub const fn required_bytes(argc: usize, envc: usize) -> usize {
        Self::slot_count(argc, envc) * WORD_SIZE as usize + ENTRY_RESERVE
    }

    /// Fail unless `region` can hold the stack for `argc`/`envc`.
    ///
    /// Depends only on the counts, so exec runs it before teardown.
    pub fn check_capacity(argc: usize, envc: usize, region: StackRegion) -> Result<(), CapacityError> {
        let needed = Self::required_bytes(argc, envc);
        if needed > region.size as usize {
            return Err(CapacityError {
                needed,
                available: region.size as usize,
            });
        }
        Ok(())
    }

    /// Lay out argc/argv/envp/auxv at the top of `region`.
    ///
    /// `argv` and `envp` are guest string addresses. The region base is
    /// expected to be word aligned, which keeps `top` word aligned.
    pub fn build(
        header: &Elf32Header,
        phdr_addr: u32,
        argv: &[u32],
        envp: &[u32],
        region: StackRegion,
        config: &LoaderConfig,
    ) -> Result<Self, CapacityError> {
        debug_assert_eq!(region.base % WORD_SIZE, 0, "stack region not word aligned");

        Self::check_capacity(argv.len(), envp.len(), region)?;

        let total_slots = Self::slot_count(argv.len(), envp.len());
        let needed = (total_slots * WORD_SIZE as usize) as u64;
        // At least ENTRY_RESERVE above base, so this fits in 32 bits.
        let top = (region.top() - needed) as u32;

        let mut words = Vec::with_capacity(total_slots);
        words.push(argv.len() as u32);
        words.extend_from_slice(argv);
        words.push(0);
        words.extend_from_slice(envp);
        words.push(0);

        for key in auxv::REQUIRED {
            let value = match key {
                auxv::AT_PHDR => phdr_addr,
                auxv::AT_PHENT => header.e_phentsize as u32,
                auxv::AT_PHNUM => header.e_phnum as u32,
                auxv::AT_PAGESZ => config.page_size,
                auxv::AT_ENTRY => header.e_entry,
                // AT_BASE: no interpreter. AT_FLAGS: always zero.
                _ => 0,
            };
            words.push(key);
            words.push(value);
        }
        words.push(auxv::AT_NULL);

        debug_assert_eq!(words.len(), total_slots);

        Ok(Self { top, words })
    }

    /// Write the slots into the process's stack region.
    pub fn commit<P: ProcessTable + ?Sized>(&self, process: &mut P) -> Result<(), CapacityError> {
        let region = process.stack_region();
        let memory = process.stack_memory_mut();
        let needed = self.words.len() * WORD_SIZE as usize;

        let overflow = CapacityError {
            needed,
            available: memory.len(),
        };
        if !region.contains(self.top) {
            return Err(overflow);
        }
        let offset = (self.top - region.base) as usize;
        if offset + needed > memory.len() {
            return Err(overflow);
        }

        for (slot, word) in memory[offset..offset + needed]
            .chunks_exact_mut(WORD_SIZE as usize)
            .zip(&self.words)
        {
            slot.copy_from_slice(&word.to_le_bytes());
        }

        #[cfg(feature = "trace-stack")]
        for (i, word) in self.words.iter().enumerate() {
            log::trace!(
                "[KPIO/Exec] stack[{:#x}] = {:#x}",
                self.top + (i as u32) * WORD_SIZE,
                word
            );
        }

        log::debug!(
            "[KPIO/Exec] Startup stack: {} slots, SP={:#x}",
            self.words.len(),
            self.top
        );

        Ok(())
    }

    /// Decode a startup stack from the bytes of its region.
    ///
    /// Returns `None` if a terminator is missing.
    pub fn decode(memory: &[u8], region_base: u32, top: u32) -> Option<DecodedStack> {
        let start = top.checked_sub(region_base)? as usize;
        let mut slots = memory
            .get(start..)?
            .chunks_exact(WORD_SIZE as usize)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));

        let argc = slots.next()?;
        let argv = (0..argc).map(|_| slots.next()).collect::<Option<Vec<_>>>()?;
        if slots.next()? != 0 {
            return None;
        }

        let mut envp = Vec::new();
        loop {
            match slots.next()? {
                0 => break,
                ptr => envp.push(ptr),
            }
        }

        let mut auxv = Vec::new();
        loop {
            let key = slots.next()?;
            if key == auxv::AT_NULL {
                break;
            }
            auxv.push((key, slots.next()?));
        }

        Some(DecodedStack {
            argc,
            argv,
            envp,
            auxv,
        })
    }
}

/// A startup stack read back from memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStack {
    /// Argument count
    pub argc: u32,
    /// Argument string pointers
    pub argv: Vec<u32>,
    /// Environment string pointers
    pub envp: Vec<u32>,
    /// Auxiliary vector pairs, terminator excluded
    pub auxv: Vec<(u32, u32)>,
}

impl DecodedStack {
    /// Value of auxv entry `key`.
    pub fn aux(&self, key: u32) -> Option<u32> {
        self.auxv.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
