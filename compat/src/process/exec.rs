//! Exec Orchestrator
//!
//! Drives parser, segment mapper, startup image builder and transfer for
//! the two ways a program starts running:
//!
//! - [`Loader::load_and_run`]: first image of a fresh process (cold)
//! - [`Loader::exec_replace`]: `execve` from a running image
//!
//! # Exec Flow
//!
//! 1. Check argv/envp against the configured limits
//! 2. Open and parse the new image, check its segments against the file
//!    and the startup stack against the stack region (nothing touched yet)
//! 3. Close guest descriptors and tear down the address space
//! 4. Map segments, publish the startup block, build and commit the stack
//! 5. Transfer (cold jump or trap snapshot rewrite)
//!
//! Everything up to step 3 can fail back into the old image. After step 3
//! there is no old image to return to; failures come back as
//! [`ExecError::Fatal`] and the caller must terminate the process.

use core::convert::Infallible;

use crate::config::LoaderConfig;
use crate::loader::elf::{Elf32Loader, ParsedImage};
use crate::loader::program::{StartupBlock, StartupStack};
use crate::loader::segment_loader::{check_segments, load_segments};
use crate::loader::LoadError;
use crate::memory::{MapError, MemoryManager};
use crate::process::context::{InitialRegisterState, TrapHandoff};
use crate::process::table::ProcessTable;
use crate::process::transfer::{transfer_cold, transfer_live, EntryTrampoline};
use crate::syscall::errno;
use crate::vfs::{FileSystem, VfsError};

/// Where a loaded image starts and what it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Entry point (`e_entry`)
    pub entry_point: u32,
    /// Initial stack pointer (address of argc)
    pub stack_top: u32,
    /// Heap break after loading
    pub brk: u32,
    /// Guest address of the published program header table
    pub phdr_addr: u32,
    /// Number of PT_LOAD segments mapped
    pub segments_mapped: usize,
}

impl LaunchPlan {
    /// Register state the image starts with.
    pub fn initial_state(&self) -> InitialRegisterState {
        InitialRegisterState::entry(self.entry_point, self.stack_top)
    }
}

/// Errors from `execve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// argv/envp exceed the configured limits
    TooManyArguments,
    /// Load failed before teardown; the old image is intact
    Load(LoadError),
    /// Load failed after teardown; the process has no image left
    Fatal(LoadError),
}

impl ExecError {
    /// Linux errno for this error (positive).
    pub fn errno(&self) -> i32 {
        match self {
            Self::TooManyArguments => errno::E2BIG,
            Self::Load(e) | Self::Fatal(e) => load_errno(e),
        }
    }

    /// True if the caller must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

fn load_errno(err: &LoadError) -> i32 {
    match err {
        LoadError::Format(_) => errno::ENOEXEC,
        LoadError::Map(MapError::Unmapped { .. }) => errno::EFAULT,
        LoadError::Map(_) => errno::ENOMEM,
        LoadError::Capacity(_) => errno::E2BIG,
        LoadError::Io(VfsError::NotFound) => errno::ENOENT,
        LoadError::Io(VfsError::PermissionDenied | VfsError::IsDirectory) => errno::EACCES,
        LoadError::Io(_) => errno::EIO,
    }
}

impl From<LoadError> for ExecError {
    fn from(e: LoadError) -> Self {
        ExecError::Load(e)
    }
}

impl core::fmt::Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::TooManyArguments => write!(f, "Argument list too long"),
            Self::Load(e) => write!(f, "Exec failed: {}", e),
            Self::Fatal(e) => write!(f, "Exec failed after teardown: {}", e),
        }
    }
}

/// Image loader bound to one process's collaborators.
///
/// Holds exclusive borrows for its whole lifetime, so nothing else can
/// touch the address space, descriptor table or stack region mid-load.
pub struct Loader<'a, M: ?Sized, F, P: ?Sized, T: ?Sized> {
    mm: &'a mut M,
    fs: &'a mut F,
    process: &'a mut P,
    trampoline: &'a mut T,
    config: LoaderConfig,
}

impl<'a, M, F, P, T> Loader<'a, M, F, P, T>
where
    M: MemoryManager + ?Sized,
    F: FileSystem,
    P: ProcessTable + ?Sized,
    T: EntryTrampoline + ?Sized,
{
    /// Bind a loader to the calling process.
    pub fn new(
        mm: &'a mut M,
        fs: &'a mut F,
        process: &'a mut P,
        trampoline: &'a mut T,
        config: LoaderConfig,
    ) -> Self {
        debug_assert!(config.validate().is_ok(), "invalid loader config");
        Self {
            mm,
            fs,
            process,
            trampoline,
            config,
        }
    }

    /// Loader configuration.
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// The process's memory manager.
    pub fn memory(&self) -> &M {
        &*self.mm
    }

    /// Load `path` into a fresh process and jump to it.
    ///
    /// Only returns on failure. A failure after the first segment was
    /// mapped leaves the address space partially populated; the process
    /// must not be run.
    pub fn load_and_run<A, E>(
        &mut self,
        path: &str,
        argv: &[A],
        envp: &[E],
    ) -> Result<Infallible, LoadError>
    where
        A: AsRef<[u8]>,
        E: AsRef<[u8]>,
    {
        let mut file = self.fs.open(path)?;
        let image = Elf32Loader::parse(&mut file)?;
        self.preflight(&image, &file, argv.len(), envp.len())?;
        let plan = self.install(&image, &mut file, argv, envp)?;
        drop(file);

        log::info!(
            "[KPIO/Exec] Launching '{}': entry={:#x}, SP={:#x}, brk={:#x}",
            path,
            plan.entry_point,
            plan.stack_top,
            plan.brk
        );

        transfer_cold(&mut *self.trampoline, &plan.initial_state())
    }

    /// Replace the calling process's image with `path`.
    ///
    /// With a `handoff` the trapped thread's snapshot is rewritten and the
    /// plan is returned; the trap return then enters the new image. Without
    /// one the loader jumps itself and this only returns on failure.
    pub fn exec_replace<A, E>(
        &mut self,
        path: &str,
        argv: &[A],
        envp: &[E],
        handoff: Option<TrapHandoff<'_>>,
    ) -> Result<LaunchPlan, ExecError>
    where
        A: AsRef<[u8]>,
        E: AsRef<[u8]>,
    {
        self.check_limits(argv, envp)?;

        let mut file = self.fs.open(path).map_err(LoadError::from)?;
        let image = Elf32Loader::parse(&mut file)?;
        self.preflight(&image, &file, argv.len(), envp.len())?;

        log::info!(
            "[KPIO/Exec] exec '{}': tearing down old image ({} args, {} env)",
            path,
            argv.len(),
            envp.len()
        );

        self.fs.reset();
        self.mm.reset();

        let plan = self
            .install(&image, &mut file, argv, envp)
            .map_err(|e| {
                log::error!("[KPIO/Exec] exec '{}' failed after teardown: {}", path, e);
                ExecError::Fatal(e)
            })?;
        drop(file);

        let state = plan.initial_state();
        match handoff {
            Some(handoff) => {
                transfer_live(handoff, &state);
                Ok(plan)
            }
            None => transfer_cold(&mut *self.trampoline, &state),
        }
    }

    /// Reject argument vectors over the configured limits.
    fn check_limits<A, E>(&self, argv: &[A], envp: &[E]) -> Result<(), ExecError>
    where
        A: AsRef<[u8]>,
        E: AsRef<[u8]>,
    {
        let bytes: usize = argv
            .iter()
            .map(|a| a.as_ref().len() + 1)
            .chain(envp.iter().map(|e| e.as_ref().len() + 1))
            .sum();

        if argv.len() > self.config.max_args
            || envp.len() > self.config.max_env
            || bytes > self.config.max_arg_bytes
        {
            log::debug!(
                "[KPIO/Exec] E2BIG: {} args, {} env, {} bytes",
                argv.len(),
                envp.len(),
                bytes
            );
            return Err(ExecError::TooManyArguments);
        }
        Ok(())
    }

    /// Everything about the load that can be decided without mapping.
    fn preflight(
        &self,
        image: &ParsedImage,
        file: &F::File,
        argc: usize,
        envc: usize,
    ) -> Result<(), LoadError> {
        check_segments(image, file, &self.config)?;
        StartupStack::check_capacity(argc, envc, self.process.stack_region())?;
        Ok(())
    }

    /// Map the image and prepare its startup stack.
    fn install<A, E>(
        &mut self,
        image: &ParsedImage,
        file: &mut F::File,
        argv: &[A],
        envp: &[E],
    ) -> Result<LaunchPlan, LoadError>
    where
        A: AsRef<[u8]>,
        E: AsRef<[u8]>,
    {
        let loaded = load_segments(image, file, &mut *self.mm, &self.config)?;

        let block = StartupBlock::publish(&mut *self.mm, &image.phdrs, argv, envp, &self.config)?;

        let stack = StartupStack::build(
            &image.header,
            block.phdr_addr,
            &block.argv,
            &block.envp,
            self.process.stack_region(),
            &self.config,
        )?;
        stack.commit(&mut *self.process)?;

        log::debug!(
            "[KPIO/Exec] Loaded {} segments, entry={:#x}, brk={:#x}",
            loaded.segments_mapped,
            loaded.entry_point,
            loaded.brk
        );

        Ok(LaunchPlan {
            entry_point: loaded.entry_point,
            stack_top: stack.top,
            brk: loaded.brk,
            phdr_addr: block.phdr_addr,
            segments_mapped: loaded.segments_mapped,
        })
    }
}
