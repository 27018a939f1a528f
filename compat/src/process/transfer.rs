//! Execution Transfer
//!
//! Two ways into a freshly loaded image:
//!
//! - **cold**: nothing to resume (process creation). The loader itself
//!   loads the initial register state and jumps; it never returns.
//! - **live**: a thread trapped into `execve`. Its saved snapshot is
//!   rewritten and the trap return performs the jump.

use super::context::{InitialRegisterState, TrapHandoff};

/// Platform primitive that loads an [`InitialRegisterState`] into the CPU
/// and jumps to its EIP.
pub trait EntryTrampoline {
    /// Enter the new image. Never returns.
    fn enter(&mut self, state: &InitialRegisterState) -> !;
}

/// Cold transfer: hand the CPU to the new image.
pub fn transfer_cold<T: EntryTrampoline + ?Sized>(
    trampoline: &mut T,
    state: &InitialRegisterState,
) -> ! {
    log::info!(
        "[KPIO/Exec] Cold transfer: entry={:#x}, SP={:#x}",
        state.entry_point(),
        state.stack_pointer()
    );
    trampoline.enter(state)
}

/// Live replacement: rewrite the trapped thread's snapshot.
///
/// The stack the old image ran on is not reclaimed here; it is released
/// with the process.
pub fn transfer_live(handoff: TrapHandoff<'_>, state: &InitialRegisterState) {
    log::info!(
        "[KPIO/Exec] Live replacement: entry={:#x}, SP={:#x} (was eip={:#x})",
        state.entry_point(),
        state.stack_pointer(),
        handoff.context().eip
    );
    handoff.resume_into(state);
}

/// Register frame in the order [`NativeEntry`] loads it.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct EntryFrame {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
}

impl From<&InitialRegisterState> for EntryFrame {
    fn from(state: &InitialRegisterState) -> Self {
        use super::context::Register;

        Self {
            eax: state.get(Register::Eax),
            ebx: state.get(Register::Ebx),
            ecx: state.get(Register::Ecx),
            edx: state.get(Register::Edx),
            esi: state.get(Register::Esi),
            edi: state.get(Register::Edi),
            ebp: state.get(Register::Ebp),
            esp: state.get(Register::Esp),
            eip: state.get(Register::Eip),
        }
    }
}

/// Jump into the guest on the current thread (i386 hosts only).
///
/// Guest and host share the address space, so this is a plain stack switch
/// followed by `ret` to the entry point.
#[cfg(target_arch = "x86")]
pub struct NativeEntry;

#[cfg(target_arch = "x86")]
impl EntryTrampoline for NativeEntry {
    fn enter(&mut self, state: &InitialRegisterState) -> ! {
        let frame = EntryFrame::from(state);
        // SAFETY: the caller mapped the image and committed the startup
        // stack; `frame` stays valid until the final `ret`.
        unsafe { enter_frame(&frame) }
    }
}

/// Load `frame` into the CPU and return into `frame.eip`.
///
/// # Safety
///
/// `frame.esp` must point at a committed startup stack with
/// [`ENTRY_RESERVE`] bytes free below it, and `frame.eip` at mapped guest
/// code. Only that one word below `esp` is written.
///
/// [`ENTRY_RESERVE`]: crate::loader::program::ENTRY_RESERVE
#[cfg(target_arch = "x86")]
unsafe fn enter_frame(frame: *const EntryFrame) -> ! {
    unsafe {
        core::arch::asm!(
            // Guest TLS selector starts null.
            "xor eax, eax",
            "mov gs, ax",
            "mov esp, [ecx + 28]",
            "push dword ptr [ecx + 32]",
            "mov eax, [ecx + 0]",
            "mov ebx, [ecx + 4]",
            "mov edx, [ecx + 12]",
            "mov esi, [ecx + 16]",
            "mov edi, [ecx + 20]",
            "mov ebp, [ecx + 24]",
            "mov ecx, [ecx + 8]",
            "ret",
            in("ecx") frame,
            options(noreturn)
        )
    }
}
