//! Process Context
//!
//! i386 register state at the two seams where the loader hands control to a
//! new image: the saved trap snapshot of an interrupted thread, and the
//! data-described initial register state both transfer paths apply.

/// Saved register snapshot of an interrupted i386 thread.
///
/// Captured by the trap front end on entry and restored verbatim on return
/// unless a handler rewrites it. Field order follows the host's integer
/// context record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TrapContext {
    // Segment selectors
    /// GS selector (guest TLS)
    pub gs: u32,
    /// FS selector
    pub fs: u32,
    /// ES selector
    pub es: u32,
    /// DS selector
    pub ds: u32,

    // General purpose registers
    /// EDI register
    pub edi: u32,
    /// ESI register
    pub esi: u32,
    /// EBX register
    pub ebx: u32,
    /// EDX register
    pub edx: u32,
    /// ECX register
    pub ecx: u32,
    /// EAX register
    pub eax: u32,
    /// EBP register (frame pointer)
    pub ebp: u32,

    // Control registers
    /// Instruction pointer
    pub eip: u32,
    /// Code segment
    pub cs: u32,
    /// EFLAGS register
    pub eflags: u32,
    /// Stack pointer
    pub esp: u32,
    /// Stack segment
    pub ss: u32,
}

impl TrapContext {
    /// Write one register.
    pub fn set(&mut self, reg: Register, value: u32) {
        match reg {
            Register::Eax => self.eax = value,
            Register::Ebx => self.ebx = value,
            Register::Ecx => self.ecx = value,
            Register::Edx => self.edx = value,
            Register::Esi => self.esi = value,
            Register::Edi => self.edi = value,
            Register::Ebp => self.ebp = value,
            Register::Esp => self.esp = value,
            Register::Eip => self.eip = value,
        }
    }

    /// Read one register.
    pub fn get(&self, reg: Register) -> u32 {
        match reg {
            Register::Eax => self.eax,
            Register::Ebx => self.ebx,
            Register::Ecx => self.ecx,
            Register::Edx => self.edx,
            Register::Esi => self.esi,
            Register::Edi => self.edi,
            Register::Ebp => self.ebp,
            Register::Esp => self.esp,
            Register::Eip => self.eip,
        }
    }

    /// Syscall number (EAX on i386 Linux)
    pub fn syscall_num(&self) -> u32 {
        self.eax
    }

    /// Syscall arguments (EBX, ECX, EDX, ESI, EDI, EBP)
    pub fn syscall_args(&self) -> (u32, u32, u32, u32, u32, u32) {
        (self.ebx, self.ecx, self.edx, self.esi, self.edi, self.ebp)
    }
}

/// Number of registers in an [`InitialRegisterState`].
pub const REGISTER_COUNT: usize = 9;

/// Registers the loader sets when entering a new image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Register {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
    Eip,
}

impl Register {
    /// Every register, in record order.
    pub const ALL: [Register; REGISTER_COUNT] = [
        Register::Eax,
        Register::Ebx,
        Register::Ecx,
        Register::Edx,
        Register::Esi,
        Register::Edi,
        Register::Ebp,
        Register::Esp,
        Register::Eip,
    ];

    /// General purpose registers (stack and instruction pointer excluded).
    pub const GENERAL_PURPOSE: [Register; 7] = [
        Register::Eax,
        Register::Ebx,
        Register::Ecx,
        Register::Edx,
        Register::Esi,
        Register::Edi,
        Register::Ebp,
    ];

    const fn index(self) -> usize {
        self as usize
    }
}

/// Register values a new image starts with.
///
/// Both transfer paths consume the same record: the cold path loads it into
/// the CPU, the live path writes it into a trap snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialRegisterState {
    values: [u32; REGISTER_COUNT],
}

impl InitialRegisterState {
    /// Process entry state: every general purpose register zero,
    /// ESP at the startup stack, EIP at the entry point.
    pub const fn entry(entry_point: u32, stack_top: u32) -> Self {
        let mut values = [0; REGISTER_COUNT];
        values[Register::Esp.index()] = stack_top;
        values[Register::Eip.index()] = entry_point;
        Self { values }
    }

    /// Value of `reg`.
    pub fn get(&self, reg: Register) -> u32 {
        self.values[reg.index()]
    }

    /// Entry point.
    pub fn entry_point(&self) -> u32 {
        self.get(Register::Eip)
    }

    /// Initial stack pointer.
    pub fn stack_pointer(&self) -> u32 {
        self.get(Register::Esp)
    }

    /// `(register, value)` pairs in record order.
    pub fn iter(&self) -> impl Iterator<Item = (Register, u32)> + '_ {
        Register::ALL.iter().map(move |&r| (r, self.get(r)))
    }
}

/// Exclusive access to the trap snapshot of the thread whose syscall is
/// being serviced.
///
/// Only the trap front end creates one, from the snapshot it owns for the
/// duration of the trap. The thread is not running while the handoff
/// exists, which is what makes rewriting its snapshot sound.
pub struct TrapHandoff<'a> {
    context: &'a mut TrapContext,
}

impl<'a> TrapHandoff<'a> {
    /// Borrow the snapshot of the trapped thread.
    pub fn new(context: &'a mut TrapContext) -> Self {
        Self { context }
    }

    /// Snapshot as captured (read-only).
    pub fn context(&self) -> &TrapContext {
        self.context
    }

    /// Make the trap return resume into a new image.
    ///
    /// One-way: the interrupted call's continuation is discarded. Only the
    /// registers in `state` are written; selectors and EFLAGS keep their
    /// captured values.
    pub fn resume_into(self, state: &InitialRegisterState) {
        for (reg, value) in state.iter() {
            self.context.set(reg, value);
        }
    }
}
