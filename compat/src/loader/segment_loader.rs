//! ELF Segment Memory Loader
//!
//! Connects the ELF parser to the process memory manager.
//!
//! # Process
//!
//! For each PT_LOAD segment, in program header order:
//!    a. Page-align the start down and grow the size by the misalignment
//!    b. Request a fixed anonymous RWX mapping for the region
//!    c. Copy `filesz` bytes from the image to `vaddr`
//!       (`filesz..memsz` is BSS and already zero)
//!    d. Tighten protection to the segment's declared permissions
//!    e. Raise the heap break to the end of the region
//!
//! A rejected mapping aborts the load. Segments mapped before it stay
//! mapped; the address space is unusable and the caller must not run it.

use super::elf::{read_error, Elf32ProgramHeader, FormatError, ParsedImage};
use super::LoadError;
use crate::config::LoaderConfig;
use crate::memory::{MapError, MapRequest, MemoryManager, Protection};
use crate::vfs::ImageFile;

/// Result of loading ELF segments into a process address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadResult {
    /// Entry point from the executable header
    pub entry_point: u32,
    /// Heap break after loading
    pub brk: u32,
    /// Number of PT_LOAD segments mapped
    pub segments_mapped: usize,
}

/// Page-aligned mapping region covering one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRegion {
    /// Page-aligned start
    pub start: u32,
    /// `memsz` plus the in-page offset of `vaddr`
    pub size: u32,
}

impl SegmentRegion {
    /// Region for `segment` with the given page mask.
    pub fn for_segment(segment: &Elf32ProgramHeader, page_mask: u32) -> Result<Self, MapError> {
        let start = segment.p_vaddr & !page_mask;
        let size = segment
            .p_memsz
            .checked_add(segment.p_vaddr & page_mask)
            .ok_or(MapError::InvalidRange)?;
        start.checked_add(size).ok_or(MapError::InvalidRange)?;
        Ok(Self { start, size })
    }

    /// Exclusive end address.
    pub fn end(&self) -> u32 {
        self.start + self.size
    }
}

/// Check every PT_LOAD segment against the image file without touching
/// memory: region arithmetic, `filesz <= memsz` and file data in bounds.
///
/// Exec runs this before tearing down the old image.
pub fn check_segments<F>(image: &ParsedImage, file: &F, config: &LoaderConfig) -> Result<(), LoadError>
where
    F: ImageFile + ?Sized,
{
    let page_mask = config.page_mask();
    let file_size = file.size().map_err(read_error)?;

    for segment in image.phdrs.load_segments() {
        SegmentRegion::for_segment(&segment, page_mask)?;

        if segment.p_filesz > segment.p_memsz {
            return Err(FormatError::SegmentFileSize {
                vaddr: segment.p_vaddr,
            }
            .into());
        }

        let data_end = segment.p_offset as u64 + segment.p_filesz as u64;
        if data_end > file_size {
            log::debug!(
                "[KPIO/Exec] PT_LOAD at {:#x} needs file bytes up to {:#x}, file has {:#x}",
                segment.p_vaddr,
                data_end,
                file_size
            );
            return Err(FormatError::Truncated.into());
        }
    }

    Ok(())
}

/// Load every PT_LOAD segment of `image` into `mm`.
///
/// `file` must be the handle `image` was parsed from.
pub fn load_segments<F, M>(
    image: &ParsedImage,
    file: &mut F,
    mm: &mut M,
    config: &LoaderConfig,
) -> Result<LoadResult, LoadError>
where
    F: ImageFile + ?Sized,
    M: MemoryManager + ?Sized,
{
    let page_mask = config.page_mask();
    let mut segments_mapped = 0;

    for segment in image.phdrs.load_segments() {
        let region = SegmentRegion::for_segment(&segment, page_mask)?;
        let prot = segment_to_protection(&segment);

        log::debug!(
            "[KPIO/Exec] PT_LOAD vaddr={:#x} memsz={:#x} filesz={:#x} -> map {:#x}+{:#x} {:?}",
            segment.p_vaddr,
            segment.p_memsz,
            segment.p_filesz,
            region.start,
            region.size,
            prot
        );

        // Writable for the copy below; tightened afterwards.
        let mapped = mm.map(MapRequest::fixed_anonymous(
            region.start,
            region.size,
            Protection::all(),
        ))?;
        if mapped != region.start {
            return Err(MapError::Rejected {
                addr: region.start,
                size: region.size,
            }
            .into());
        }

        if segment.p_filesz > 0 {
            file.seek(segment.p_offset).map_err(read_error)?;
            let window = mm
                .memory_mut(segment.p_vaddr, segment.p_filesz)
                .ok_or(MapError::Unmapped {
                    addr: segment.p_vaddr,
                    len: segment.p_filesz,
                })?;
            file.read_exact(window).map_err(read_error)?;
        }

        if prot != Protection::all() {
            mm.protect(region.start, region.size, prot)?;
        }

        if region.end() > mm.brk() {
            mm.update_brk(region.end());
        }

        segments_mapped += 1;
    }

    Ok(LoadResult {
        entry_point: image.header.e_entry,
        brk: mm.brk(),
        segments_mapped,
    })
}

/// Convert ELF segment flags to mapping protection.
///
/// A segment that declares no permission at all stays readable.
pub fn segment_to_protection(segment: &Elf32ProgramHeader) -> Protection {
    let mut prot = Protection::empty();

    if segment.is_readable() {
        prot |= Protection::READ;
    }
    if segment.is_writable() {
        prot |= Protection::WRITE;
    }
    if segment.is_executable() {
        prot |= Protection::EXEC;
    }

    if prot.is_empty() {
        log::warn!(
            "[KPIO/Exec] PT_LOAD at {:#x} declares no permissions, mapping read-only",
            segment.p_vaddr
        );
        Protection::READ
    } else {
        prot
    }
}
