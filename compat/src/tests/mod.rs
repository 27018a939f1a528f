//! Loader Scenario Tests
//!
//! End-to-end runs of launch and exec against the in-memory collaborators.


use crate::config::LoaderConfig;
use crate::process::exec::Loader;
use crate::testing::{MockFileSystem, MockMemory, MockProcess, RecordingTrampoline};

/// Stack region used by every scenario: 1 MB ending at 0xC000_0000.
pub(crate) const STACK_BASE: u32 = 0xBFF0_0000;
pub(crate) const STACK_SIZE: u32 = 0x10_0000;

/// One process worth of collaborators.
pub(crate) struct Harness {
    pub mm: MockMemory,
    pub fs: MockFileSystem,
    pub process: MockProcess,
    pub trampoline: RecordingTrampoline,
    pub config: LoaderConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            mm: MockMemory::new(),
            fs: MockFileSystem::new(),
            process: MockProcess::new(STACK_BASE, STACK_SIZE),
            trampoline: RecordingTrampoline::default(),
            config: LoaderConfig::default(),
        }
    }

    pub fn loader(
        &mut self,
    ) -> Loader<'_, MockMemory, MockFileSystem, MockProcess, RecordingTrampoline> {
        Loader::new(
            &mut self.mm,
            &mut self.fs,
            &mut self.process,
            &mut self.trampoline,
            self.config,
        )
    }
}
