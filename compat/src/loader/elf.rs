//! ELF32 Parser
//!
//! Reads and validates the executable header and the program header table
//! of an i386 image. Nothing here maps memory or touches process state.

use alloc::vec;
use alloc::vec::Vec;

use super::LoadError;
use crate::vfs::{ImageFile, VfsError};

/// ELF magic number: 0x7F 'E' 'L' 'F'
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// ELF class: 32-bit
pub const ELFCLASS32: u8 = 1;

/// ELF data encoding: little endian
pub const ELFDATA2LSB: u8 = 1;

/// ELF type: relocatable object
pub const ET_REL: u16 = 1;

/// ELF type: executable
pub const ET_EXEC: u16 = 2;

/// ELF type: shared object
pub const ET_DYN: u16 = 3;

/// Machine type: Intel 80386
pub const EM_386: u16 = 3;

/// Machine type: x86_64
pub const EM_X86_64: u16 = 62;

/// Program header type: loadable segment
pub const PT_LOAD: u32 = 1;

/// Program header type: interpreter path
pub const PT_INTERP: u32 = 3;

/// Segment permission: executable
pub const PF_X: u32 = 1;

/// Segment permission: writable
pub const PF_W: u32 = 2;

/// Segment permission: readable
pub const PF_R: u32 = 4;

/// Size of the ELF32 file header on disk.
pub const EHDR_SIZE: usize = 52;

/// Size of one ELF32 program header on disk.
pub const PHDR_SIZE: usize = 32;

/// ELF32 file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Elf32Header {
    /// Magic number and other info
    pub e_ident: [u8; 16],
    /// Object file type
    pub e_type: u16,
    /// Machine type
    pub e_machine: u16,
    /// Object file version
    pub e_version: u32,
    /// Entry point virtual address
    pub e_entry: u32,
    /// Program header table file offset
    pub e_phoff: u32,
    /// Section header table file offset
    pub e_shoff: u32,
    /// Processor-specific flags
    pub e_flags: u32,
    /// ELF header size
    pub e_ehsize: u16,
    /// Program header table entry size
    pub e_phentsize: u16,
    /// Program header table entry count
    pub e_phnum: u16,
    /// Section header table entry size
    pub e_shentsize: u16,
    /// Section header table entry count
    pub e_shnum: u16,
    /// Section name string table index
    pub e_shstrndx: u16,
}

impl Elf32Header {
    /// Decode a header from its on-disk little-endian layout.
    pub fn from_bytes(raw: &[u8; EHDR_SIZE]) -> Self {
        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(&raw[0..16]);

        Self {
            e_ident,
            e_type: le16(raw, 16),
            e_machine: le16(raw, 18),
            e_version: le32(raw, 20),
            e_entry: le32(raw, 24),
            e_phoff: le32(raw, 28),
            e_shoff: le32(raw, 32),
            e_flags: le32(raw, 36),
            e_ehsize: le16(raw, 40),
            e_phentsize: le16(raw, 42),
            e_phnum: le16(raw, 44),
            e_shentsize: le16(raw, 46),
            e_shnum: le16(raw, 48),
            e_shstrndx: le16(raw, 50),
        }
    }

    /// Byte length of the program header table.
    pub fn phdr_table_size(&self) -> usize {
        self.e_phentsize as usize * self.e_phnum as usize
    }
}

/// ELF32 program header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Elf32ProgramHeader {
    /// Segment type
    pub p_type: u32,
    /// Segment file offset
    pub p_offset: u32,
    /// Segment virtual address
    pub p_vaddr: u32,
    /// Segment physical address (unused)
    pub p_paddr: u32,
    /// Segment size in file
    pub p_filesz: u32,
    /// Segment size in memory
    pub p_memsz: u32,
    /// Segment flags
    pub p_flags: u32,
    /// Segment alignment
    pub p_align: u32,
}

impl Elf32ProgramHeader {
    /// Decode an entry; `raw` must hold at least [`PHDR_SIZE`] bytes.
    pub fn from_bytes(raw: &[u8]) -> Self {
        Self {
            p_type: le32(raw, 0),
            p_offset: le32(raw, 4),
            p_vaddr: le32(raw, 8),
            p_paddr: le32(raw, 12),
            p_filesz: le32(raw, 16),
            p_memsz: le32(raw, 20),
            p_flags: le32(raw, 24),
            p_align: le32(raw, 28),
        }
    }

    /// Check if segment must be mapped
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }

    /// Check if segment is readable
    pub fn is_readable(&self) -> bool {
        self.p_flags & PF_R != 0
    }

    /// Check if segment is writable
    pub fn is_writable(&self) -> bool {
        self.p_flags & PF_W != 0
    }

    /// Check if segment is executable
    pub fn is_executable(&self) -> bool {
        self.p_flags & PF_X != 0
    }
}

/// Raw program header table exactly as read from the image.
///
/// The bytes are published unmodified to the guest (`AT_PHDR`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramHeaderTable {
    raw: Vec<u8>,
    entry_size: usize,
}

impl ProgramHeaderTable {
    /// Wrap table bytes with the header-declared entry size.
    pub fn new(raw: Vec<u8>, entry_size: usize) -> Self {
        Self { raw, entry_size }
    }

    /// Table bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Table length in bytes.
    pub fn byte_len(&self) -> usize {
        self.raw.len()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        if self.entry_size == 0 {
            0
        } else {
            self.raw.len() / self.entry_size
        }
    }

    /// True if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in table order.
    pub fn entries(&self) -> impl Iterator<Item = Elf32ProgramHeader> + '_ {
        self.raw
            .chunks_exact(self.entry_size.max(PHDR_SIZE))
            .map(Elf32ProgramHeader::from_bytes)
    }

    /// `PT_LOAD` entries in table order.
    pub fn load_segments(&self) -> impl Iterator<Item = Elf32ProgramHeader> + '_ {
        self.entries().filter(Elf32ProgramHeader::is_load)
    }
}

/// Parsed executable: header plus its program header table.
#[derive(Debug, Clone)]
pub struct ParsedImage {
    /// Executable header
    pub header: Elf32Header,
    /// Program header table
    pub phdrs: ProgramHeaderTable,
}

/// Executable format errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatError {
    /// File ends before the header or program header table does
    Truncated,
    /// Invalid ELF magic number
    InvalidMagic,
    /// Invalid ELF class (not 32-bit)
    InvalidClass,
    /// Invalid data encoding (not little endian)
    InvalidEncoding,
    /// Not a statically runnable executable
    InvalidType(u16),
    /// Machine is not i386
    InvalidMachine(u16),
    /// Program header entries smaller than an ELF32 program header
    InvalidPhentsize(u16),
    /// A `PT_LOAD` segment has more file bytes than memory bytes
    SegmentFileSize { vaddr: u32 },
}

impl core::fmt::Display for FormatError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Truncated => write!(f, "Truncated image"),
            Self::InvalidMagic => write!(f, "Not an ELF image"),
            Self::InvalidClass => write!(f, "Not a 32-bit ELF image"),
            Self::InvalidEncoding => write!(f, "Not a little-endian ELF image"),
            Self::InvalidType(t) => write!(f, "Not an executable (e_type={})", t),
            Self::InvalidMachine(m) => write!(f, "Not an i386 executable (e_machine={})", m),
            Self::InvalidPhentsize(s) => write!(f, "Bad program header size {}", s),
            Self::SegmentFileSize { vaddr } => {
                write!(f, "Segment at {:#x} has filesz > memsz", vaddr)
            }
        }
    }
}

/// ELF32 image parser
pub struct Elf32Loader;

impl Elf32Loader {
    /// Read and validate the header, then read the program header table.
    ///
    /// Performs at most two seeks and two reads on `file`.
    pub fn parse<F: ImageFile + ?Sized>(file: &mut F) -> Result<ParsedImage, LoadError> {
        let mut raw = [0u8; EHDR_SIZE];
        file.seek(0).map_err(read_error)?;
        file.read_exact(&mut raw).map_err(read_error)?;

        let header = Elf32Header::from_bytes(&raw);
        Self::validate_header(&header)?;

        let mut table = vec![0u8; header.phdr_table_size()];
        if !table.is_empty() {
            file.seek(header.e_phoff).map_err(read_error)?;
            file.read_exact(&mut table).map_err(read_error)?;
        }

        log::debug!(
            "[KPIO/Exec] ELF header: entry={:#x} phoff={:#x} phentsize={} phnum={}",
            header.e_entry,
            header.e_phoff,
            header.e_phentsize,
            header.e_phnum
        );

        Ok(ParsedImage {
            phdrs: ProgramHeaderTable::new(table, header.e_phentsize as usize),
            header,
        })
    }

    /// Validate ELF header
    pub fn validate_header(header: &Elf32Header) -> Result<(), FormatError> {
        if header.e_ident[0..4] != ELF_MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        if header.e_ident[4] != ELFCLASS32 {
            return Err(FormatError::InvalidClass);
        }

        if header.e_ident[5] != ELFDATA2LSB {
            return Err(FormatError::InvalidEncoding);
        }

        if header.e_type != ET_EXEC {
            log::debug!("[KPIO/Exec] Not an executable (e_type={})", header.e_type);
            return Err(FormatError::InvalidType(header.e_type));
        }

        if header.e_machine != EM_386 {
            log::debug!("[KPIO/Exec] Not an i386 executable (e_machine={})", header.e_machine);
            return Err(FormatError::InvalidMachine(header.e_machine));
        }

        if header.e_phnum != 0 && (header.e_phentsize as usize) < PHDR_SIZE {
            return Err(FormatError::InvalidPhentsize(header.e_phentsize));
        }

        Ok(())
    }
}

/// Map a failed image read; running off the end of the file is a format error.
pub(super) fn read_error(err: VfsError) -> LoadError {
    match err {
        VfsError::UnexpectedEof | VfsError::InvalidSeek => LoadError::Format(FormatError::Truncated),
        other => LoadError::Io(other),
    }
}

fn le16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

fn le32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}
