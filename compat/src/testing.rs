//! In-memory collaborators for host tests.
//!
//! `MockMemory`, `MockFileSystem` and `MockProcess` stand in for the
//! runtime's memory manager, VFS and process table. `ElfBuilder` assembles
//! small i386 executables in memory.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;
use std::panic::{self, AssertUnwindSafe};

use crate::loader::elf::{EHDR_SIZE, ELFCLASS32, ELFDATA2LSB, ELF_MAGIC, EM_386, ET_EXEC, PHDR_SIZE, PT_LOAD};
use crate::memory::{MapError, MapFlags, MapRequest, MemoryManager, Protection};
use crate::process::context::InitialRegisterState;
use crate::process::table::{ProcessTable, StackRegion};
use crate::process::transfer::EntryTrampoline;
use crate::vfs::{FileSystem, ImageFile, VfsError};

/// Where non-fixed mappings are placed.
pub const ANON_BASE: u32 = 0x4000_0000;

// ─── Memory manager ──────────────────────────────────────────────────

/// Mutating memory manager call, in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryCall {
    Map(MapRequest),
    Protect { addr: u32, size: u32, prot: Protection },
    UpdateBrk(u32),
    Reset,
}

#[derive(Debug)]
struct Region {
    start: u32,
    prot: Protection,
    data: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.start as u64 + self.data.len() as u64
    }

    fn overlaps(&self, start: u32, size: u32) -> bool {
        (start as u64) < self.end() && (self.start as u64) < start as u64 + size as u64
    }

    fn window(&self, addr: u32, len: u32) -> Option<core::ops::Range<usize>> {
        let end = addr as u64 + len as u64;
        if addr >= self.start && end <= self.end() {
            let offset = (addr - self.start) as usize;
            Some(offset..offset + len as usize)
        } else {
            None
        }
    }
}

/// Flat guest address space backed by host vectors.
#[derive(Debug)]
pub struct MockMemory {
    regions: Vec<Region>,
    reserved: Vec<(u32, u32)>,
    calls: Vec<MemoryCall>,
    brk: u32,
    next_anon: u32,
    resets: usize,
}

impl MockMemory {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            reserved: Vec::new(),
            calls: Vec::new(),
            brk: 0,
            next_anon: ANON_BASE,
            resets: 0,
        }
    }

    /// Make fixed mappings overlapping `[addr, addr + size)` fail.
    /// Survives `reset`.
    pub fn reserve(&mut self, addr: u32, size: u32) {
        self.reserved.push((addr, size));
    }

    /// Copy of guest bytes. Panics if the range is not mapped.
    pub fn read(&self, addr: u32, len: u32) -> Vec<u8> {
        self.memory(addr, len)
            .unwrap_or_else(|| panic!("unmapped read at {:#x}+{}", addr, len))
            .to_vec()
    }

    pub fn protection_at(&self, addr: u32) -> Option<Protection> {
        self.regions
            .iter()
            .find(|r| r.window(addr, 1).is_some())
            .map(|r| r.prot)
    }

    pub fn is_mapped(&self, addr: u32) -> bool {
        self.protection_at(addr).is_some()
    }

    pub fn calls(&self) -> &[MemoryCall] {
        &self.calls
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn resets(&self) -> usize {
        self.resets
    }

    fn region_for(&self, addr: u32, len: u32) -> Option<(usize, core::ops::Range<usize>)> {
        self.regions
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.window(addr, len).map(|w| (i, w)))
    }
}

impl Default for MockMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryManager for MockMemory {
    fn map(&mut self, request: MapRequest) -> Result<u32, MapError> {
        self.calls.push(MemoryCall::Map(request));

        if request.addr as u64 + request.size as u64 > u32::MAX as u64 + 1 {
            return Err(MapError::InvalidRange);
        }

        let start = if request.flags.contains(MapFlags::FIXED) {
            let hits_reserved = self.reserved.iter().any(|&(addr, size)| {
                (request.addr as u64) < addr as u64 + size as u64
                    && (addr as u64) < request.addr as u64 + request.size as u64
            });
            if hits_reserved {
                return Err(MapError::Rejected {
                    addr: request.addr,
                    size: request.size,
                });
            }
            // MAP_FIXED replaces whatever was there.
            self.regions
                .retain(|r| !r.overlaps(request.addr, request.size));
            request.addr
        } else {
            let start = self.next_anon;
            let pages = (request.size as u64 + 0xFFF) & !0xFFF;
            self.next_anon = u32::try_from(start as u64 + pages).map_err(|_| MapError::OutOfMemory)?;
            start
        };

        self.regions.push(Region {
            start,
            prot: request.prot,
            data: vec![0; request.size as usize],
        });
        Ok(start)
    }

    fn protect(&mut self, addr: u32, size: u32, prot: Protection) -> Result<(), MapError> {
        self.calls.push(MemoryCall::Protect { addr, size, prot });

        let mut hit = false;
        for region in self.regions.iter_mut().filter(|r| r.overlaps(addr, size)) {
            region.prot = prot;
            hit = true;
        }
        if hit {
            Ok(())
        } else {
            Err(MapError::Unmapped { addr, len: size })
        }
    }

    fn memory(&self, addr: u32, len: u32) -> Option<&[u8]> {
        let (i, window) = self.region_for(addr, len)?;
        Some(&self.regions[i].data[window])
    }

    fn memory_mut(&mut self, addr: u32, len: u32) -> Option<&mut [u8]> {
        let (i, window) = self.region_for(addr, len)?;
        Some(&mut self.regions[i].data[window])
    }

    fn brk(&self) -> u32 {
        self.brk
    }

    fn update_brk(&mut self, addr: u32) {
        self.calls.push(MemoryCall::UpdateBrk(addr));
        self.brk = addr;
    }

    fn reset(&mut self) {
        self.calls.push(MemoryCall::Reset);
        self.regions.clear();
        self.brk = 0;
        self.next_anon = ANON_BASE;
        self.resets += 1;
    }
}

/// Read a NUL-terminated string of at most `max` bytes from guest memory.
///
/// Returns the bytes without the terminator.
pub fn read_guest_string<M: MemoryManager + ?Sized>(mm: &M, addr: u32, max: usize) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    let mut cursor = addr;
    while out.len() < max {
        let byte = *mm.memory(cursor, 1)?.first()?;
        if byte == 0 {
            return Some(out);
        }
        out.push(byte);
        cursor = cursor.checked_add(1)?;
    }
    None
}

// ─── File system ─────────────────────────────────────────────────────

/// Seekable in-memory file.
#[derive(Debug, Clone)]
pub struct MockFile {
    data: Vec<u8>,
    pos: usize,
}

impl MockFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl ImageFile for MockFile {
    fn seek(&mut self, offset: u32) -> Result<(), VfsError> {
        let offset = offset as usize;
        if offset > self.data.len() {
            return Err(VfsError::InvalidSeek);
        }
        self.pos = offset;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), VfsError> {
        let end = self.pos + buf.len();
        let src = self.data.get(self.pos..end).ok_or(VfsError::UnexpectedEof)?;
        buf.copy_from_slice(src);
        self.pos = end;
        Ok(())
    }
    fn size(&self) -> Result<u64, VfsError> {
        Ok(self.data.len() as u64)
    }
}

/// Path → bytes table with open/reset bookkeeping.
#[derive(Debug, Default)]
pub struct MockFileSystem {
    files: BTreeMap<String, Vec<u8>>,
    denied: Vec<String>,
    opened: Vec<String>,
    resets: usize,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }

    /// Make `open(path)` fail with `PermissionDenied`.
    pub fn deny(&mut self, path: &str) {
        self.denied.push(path.to_string());
    }

    pub fn opened(&self) -> &[String] {
        &self.opened
    }

    pub fn resets(&self) -> usize {
        self.resets
    }
}

impl FileSystem for MockFileSystem {
    type File = MockFile;

    fn open(&mut self, path: &str) -> Result<MockFile, VfsError> {
        self.opened.push(path.to_string());
        if self.denied.iter().any(|p| p == path) {
            return Err(VfsError::PermissionDenied);
        }
        self.files
            .get(path)
            .cloned()
            .map(MockFile::new)
            .ok_or(VfsError::NotFound)
    }

    fn reset(&mut self) {
        self.resets += 1;
    }
}

// ─── Process table ───────────────────────────────────────────────────

/// One process with a host-backed stack region.
#[derive(Debug)]
pub struct MockProcess {
    region: StackRegion,
    memory: Vec<u8>,
}

impl MockProcess {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            region: StackRegion { base, size },
            memory: vec![0; size as usize],
        }
    }

    pub fn stack(&self) -> &[u8] {
        &self.memory
    }

    /// Word at a guest address inside the stack region.
    pub fn word_at(&self, addr: u32) -> u32 {
        let off = (addr - self.region.base) as usize;
        let b = &self.memory[off..off + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

impl ProcessTable for MockProcess {
    fn stack_region(&self) -> StackRegion {
        self.region
    }

    fn stack_memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}

// ─── Transfer ────────────────────────────────────────────────────────

/// Panic payload raised by [`RecordingTrampoline`] in place of a jump.
#[derive(Debug, Clone, Copy)]
struct Entered(InitialRegisterState);

/// Trampoline that unwinds with the state it was asked to enter.
#[derive(Debug, Default)]
pub struct RecordingTrampoline {
    pub entries: usize,
}

impl EntryTrampoline for RecordingTrampoline {
    fn enter(&mut self, state: &InitialRegisterState) -> ! {
        self.entries += 1;
        panic::resume_unwind(Box::new(Entered(*state)))
    }
}

/// Run `f`, turning a [`RecordingTrampoline`] entry into `Ok(state)`.
///
/// `Err` carries `f`'s return value when it came back without entering.
pub fn catch_entry<R>(f: impl FnOnce() -> R) -> Result<InitialRegisterState, R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(returned) => Err(returned),
        Err(payload) => match payload.downcast::<Entered>() {
            Ok(entered) => Ok(entered.0),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

// ─── Images ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Phdr {
    Segment {
        vaddr: u32,
        flags: u32,
        data: Vec<u8>,
        memsz: u32,
    },
    Raw {
        p_type: u32,
        offset: u32,
        vaddr: u32,
        filesz: u32,
        memsz: u32,
        flags: u32,
    },
}

/// Builds ELF32 i386 executables: header, program header table, then
/// segment data in declaration order.
#[derive(Debug, Clone)]
pub struct ElfBuilder {
    entry: u32,
    e_type: u16,
    machine: u16,
    phdrs: Vec<Phdr>,
}

impl ElfBuilder {
    pub fn new(entry: u32) -> Self {
        Self {
            entry,
            e_type: ET_EXEC,
            machine: EM_386,
            phdrs: Vec::new(),
        }
    }

    pub fn e_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// PT_LOAD entry whose file bytes are `data`.
    pub fn segment(mut self, vaddr: u32, flags: u32, data: &[u8], memsz: u32) -> Self {
        self.phdrs.push(Phdr::Segment {
            vaddr,
            flags,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    /// Entry written as given, with no data appended.
    pub fn raw_phdr(
        mut self,
        p_type: u32,
        offset: u32,
        vaddr: u32,
        filesz: u32,
        memsz: u32,
        flags: u32,
    ) -> Self {
        self.phdrs.push(Phdr::Raw {
            p_type,
            offset,
            vaddr,
            filesz,
            memsz,
            flags,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let phoff = EHDR_SIZE;
        let mut data_offset = phoff + self.phdrs.len() * PHDR_SIZE;

        let mut out = Vec::new();
        out.extend_from_slice(&ELF_MAGIC);
        out.extend_from_slice(&[ELFCLASS32, ELFDATA2LSB, 1]);
        out.resize(16, 0);
        out.extend_from_slice(&self.e_type.to_le_bytes());
        out.extend_from_slice(&self.machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(phoff as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(self.phdrs.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        debug_assert_eq!(out.len(), EHDR_SIZE);

        let mut payload = Vec::new();
        for phdr in &self.phdrs {
            let words = match phdr {
                Phdr::Segment {
                    vaddr,
                    flags,
                    data,
                    memsz,
                } => {
                    let offset = data_offset as u32;
                    data_offset += data.len();
                    payload.extend_from_slice(data);
                    [PT_LOAD, offset, *vaddr, *vaddr, data.len() as u32, *memsz, *flags, 0x1000]
                }
                Phdr::Raw {
                    p_type,
                    offset,
                    vaddr,
                    filesz,
                    memsz,
                    flags,
                } => [*p_type, *offset, *vaddr, *vaddr, *filesz, *memsz, *flags, 0x1000],
            };
            for word in words {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }

        out.extend_from_slice(&payload);
        out
    }
}
