//! Virtual file system contract.
//!
//! The loader opens the image through a kernel-side handle that is not part
//! of the guest's descriptor table, so [`FileSystem::reset`] leaves it
//! usable while an exec is in flight.

/// VFS failures seen by the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    /// Path does not exist.
    NotFound,
    /// Caller may not open the file.
    PermissionDenied,
    /// Path names a directory.
    IsDirectory,
    /// Seek past the end of the file or to an invalid position.
    InvalidSeek,
    /// Fewer bytes were available than requested.
    UnexpectedEof,
    /// Backing device error.
    Io,
}

impl core::fmt::Display for VfsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "File not found"),
            Self::PermissionDenied => write!(f, "Permission denied"),
            Self::IsDirectory => write!(f, "Is a directory"),
            Self::InvalidSeek => write!(f, "Invalid seek"),
            Self::UnexpectedEof => write!(f, "Unexpected end of file"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

/// An open, seekable executable image. Dropping the handle closes it.
pub trait ImageFile {
    /// Move the cursor to an absolute offset.
    fn seek(&mut self, offset: u32) -> Result<(), VfsError>;

    /// Fill `buf` completely or fail with [`VfsError::UnexpectedEof`].
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), VfsError>;

    /// File length in bytes.
    fn size(&self) -> Result<u64, VfsError>;
}

/// The process's file system view.
pub trait FileSystem {
    /// Handle type returned by [`FileSystem::open`].
    type File: ImageFile;

    /// Open a file for reading by path.
    fn open(&mut self, path: &str) -> Result<Self::File, VfsError>;

    /// Close every guest file descriptor (used before exec).
    fn reset(&mut self);
}
