//! `execve` syscall adapter (i386 Linux ABI).
//!
//! Copies the path, argv and envp out of guest memory before the address
//! space is torn down, runs the exec and folds the result into the
//! `0` / `-errno` convention the trap front end writes back into EAX.

use alloc::string::String;
use alloc::vec::Vec;

use crate::memory::{read_guest_word, MemoryManager};
use crate::process::context::TrapHandoff;
use crate::process::exec::Loader;
use crate::process::table::ProcessTable;
use crate::process::transfer::EntryTrampoline;
use crate::vfs::FileSystem;

/// Linux errno values (positive). Handlers return them negated.
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const E2BIG: i32 = 7;
    pub const ENOEXEC: i32 = 8;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EINVAL: i32 = 22;
    pub const ENAMETOOLONG: i32 = 36;
}

use self::errno::*;

/// `execve` syscall number on i386.
pub const SYS_EXECVE: u32 = 11;

/// Longest path accepted, terminator included.
pub const PATH_MAX: usize = 4096;

/// Service an `execve` trap using the arguments in the saved snapshot
/// (EBX = path, ECX = argv, EDX = envp).
pub fn execve_from_trap<M, F, P, T>(loader: &mut Loader<'_, M, F, P, T>, handoff: TrapHandoff<'_>) -> i32
where
    M: MemoryManager + ?Sized,
    F: FileSystem,
    P: ProcessTable + ?Sized,
    T: EntryTrampoline + ?Sized,
{
    let (path_ptr, argv_ptr, envp_ptr, _, _, _) = handoff.context().syscall_args();
    sys_execve(loader, path_ptr, argv_ptr, envp_ptr, handoff)
}

/// `execve(path, argv, envp)`.
///
/// Returns `0` once the snapshot has been rewritten, `-errno` otherwise.
/// A failure after the old image was torn down is logged as an error and
/// still returns `-errno`; the caller must then terminate the process
/// instead of resuming it.
pub fn sys_execve<M, F, P, T>(
    loader: &mut Loader<'_, M, F, P, T>,
    path_ptr: u32,
    argv_ptr: u32,
    envp_ptr: u32,
    handoff: TrapHandoff<'_>,
) -> i32
where
    M: MemoryManager + ?Sized,
    F: FileSystem,
    P: ProcessTable + ?Sized,
    T: EntryTrampoline + ?Sized,
{
    let (path, argv, envp) = match copy_exec_args(loader, path_ptr, argv_ptr, envp_ptr) {
        Ok(args) => args,
        Err(e) => return e,
    };

    match loader.exec_replace(&path, &argv, &envp, Some(handoff)) {
        Ok(_) => 0,
        Err(e) => {
            if e.is_fatal() {
                log::error!("[KPIO/Exec] execve('{}'): {}; process must exit", path, e);
            } else {
                log::debug!("[KPIO/Exec] execve('{}'): {}", path, e);
            }
            -e.errno()
        }
    }
}

/// Owned copies of the path, argv and envp.
type ExecArgs = (String, Vec<Vec<u8>>, Vec<Vec<u8>>);

fn copy_exec_args<M, F, P, T>(
    loader: &Loader<'_, M, F, P, T>,
    path_ptr: u32,
    argv_ptr: u32,
    envp_ptr: u32,
) -> Result<ExecArgs, i32>
where
    M: MemoryManager + ?Sized,
    F: FileSystem,
    P: ProcessTable + ?Sized,
    T: EntryTrampoline + ?Sized,
{
    let mm = loader.memory();
    let config = loader.config();

    if path_ptr == 0 {
        return Err(-EFAULT);
    }
    let path = read_user_bytes(mm, path_ptr, PATH_MAX - 1, -ENAMETOOLONG)?;
    let path = String::from_utf8(path).map_err(|_| -EINVAL)?;

    let mut budget = config.max_arg_bytes;
    let argv = read_user_vector(mm, argv_ptr, config.max_args, &mut budget)?;
    let envp = read_user_vector(mm, envp_ptr, config.max_env, &mut budget)?;

    Ok((path, argv, envp))
}

/// Read a NUL-terminated string of at most `max` bytes.
///
/// Fails with `-EFAULT` on unmapped memory and with `too_long` when no
/// terminator appears within `max` bytes.
fn read_user_bytes<M: MemoryManager + ?Sized>(
    mm: &M,
    ptr: u32,
    max: usize,
    too_long: i32,
) -> Result<Vec<u8>, i32> {
    let mut out = Vec::new();
    let mut addr = ptr;
    loop {
        let byte = mm.memory(addr, 1).and_then(|b| b.first().copied()).ok_or(-EFAULT)?;
        if byte == 0 {
            return Ok(out);
        }
        if out.len() == max {
            return Err(too_long);
        }
        out.push(byte);
        addr = addr.checked_add(1).ok_or(-EFAULT)?;
    }
}

/// Read a NULL-terminated vector of string pointers.
///
/// A null `ptr` is an empty vector. Every string consumes its length plus
/// the terminator from `budget`.
fn read_user_vector<M: MemoryManager + ?Sized>(
    mm: &M,
    ptr: u32,
    max_entries: usize,
    budget: &mut usize,
) -> Result<Vec<Vec<u8>>, i32> {
    let mut out = Vec::new();
    if ptr == 0 {
        return Ok(out);
    }

    let mut slot = ptr;
    loop {
        let str_ptr = read_guest_word(mm, slot).ok_or(-EFAULT)?;
        if str_ptr == 0 {
            return Ok(out);
        }
        if out.len() == max_entries || *budget == 0 {
            return Err(-E2BIG);
        }

        let s = read_user_bytes(mm, str_ptr, *budget - 1, -E2BIG)?;
        *budget -= s.len() + 1;
        out.push(s);

        slot = slot.checked_add(4).ok_or(-EFAULT)?;
    }
}
