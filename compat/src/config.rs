//! Loader configuration.
//!
//! Compile-time defaults plus the [`LoaderConfig`] value that is threaded
//! through every load and exec call.

/// Page size of the i386 guest (4 KB).
pub const PAGE_SIZE: u32 = 4096;

/// Per-process startup stack region size (1 MB).
pub const STACK_SIZE: u32 = 1024 * 1024;

/// Machine word size of the guest ABI in bytes.
pub const WORD_SIZE: u32 = 4;

/// Maximum number of argv entries accepted by exec.
pub const MAX_ARGS: usize = 1024;

/// Maximum number of envp entries accepted by exec.
pub const MAX_ENV: usize = 1024;

/// Maximum combined size of argv and envp strings, NULs included (128 KB).
pub const MAX_ARG_BYTES: usize = 128 * 1024;

/// Runtime loader parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Guest page size; must be a power of two.
    pub page_size: u32,
    /// Maximum argv entries.
    pub max_args: usize,
    /// Maximum envp entries.
    pub max_env: usize,
    /// Maximum bytes of argument and environment strings.
    pub max_arg_bytes: usize,
}

impl LoaderConfig {
    /// Build a configuration with the given page size and default limits.
    pub const fn with_page_size(page_size: u32) -> Self {
        Self {
            page_size,
            max_args: MAX_ARGS,
            max_env: MAX_ENV,
            max_arg_bytes: MAX_ARG_BYTES,
        }
    }

    /// Mask of the in-page offset bits.
    pub const fn page_mask(&self) -> u32 {
        self.page_size - 1
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err("page size must be a non-zero power of two");
        }
        if self.page_size < WORD_SIZE {
            return Err("page size smaller than a machine word");
        }
        Ok(())
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self::with_page_size(PAGE_SIZE)
    }
}
