//! System-call surface
//!
//! A single software-interrupt gate fans out to the primitives below.
//! The call number arrives in the accumulator and up to five arguments
//! in the remaining registers; the signed result goes back in the
//! accumulator, negative values being `KernelError` discriminants.
//!
//! Every primitive validates before it mutates: argument errors
//! (`INVAL`, `BAD_ENV`) leave no side effects, and the one partial
//! allocation (`page_alloc`'s fresh frame) is rolled back before
//! `NO_MEM` is reported.

use crate::console;
use crate::env::{EnvId, EnvStatus, EnvTable};
use crate::error::{KernelError, Result};
use crate::ipc;
use crate::mm::{PageAllocator, PteFlags, VirtAddr, UTOP};
use crate::trap::{EFlags, Trapframe};

/// System call numbers
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Cputs = 0,
    Cgetc = 1,
    Getenvid = 2,
    EnvDestroy = 3,
    PageAlloc = 4,
    PageMap = 5,
    PageUnmap = 6,
    Exofork = 7,
    EnvSetStatus = 8,
    EnvSetTrapframe = 9,
    EnvSetPgfaultUpcall = 10,
    Yield = 11,
    IpcTrySend = 12,
    IpcRecv = 13,
}

impl TryFrom<u32> for Syscall {
    type Error = KernelError;

    fn try_from(no: u32) -> Result<Self> {
        Ok(match no {
            0 => Self::Cputs,
            1 => Self::Cgetc,
            2 => Self::Getenvid,
            3 => Self::EnvDestroy,
            4 => Self::PageAlloc,
            5 => Self::PageMap,
            6 => Self::PageUnmap,
            7 => Self::Exofork,
            8 => Self::EnvSetStatus,
            9 => Self::EnvSetTrapframe,
            10 => Self::EnvSetPgfaultUpcall,
            11 => Self::Yield,
            12 => Self::IpcTrySend,
            13 => Self::IpcRecv,
            _ => return Err(KernelError::NoSys),
        })
    }
}

/// What the trap dispatcher should do after a system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Deliver this value in the caller's result register and resume it
    Return(i32),
    /// The caller gave up the CPU (or parked itself); reschedule
    /// without touching its result register
    Yield,
}

// User-visible environment status encoding for env_set_status.
pub const ENV_RUNNABLE: u32 = 2;
pub const ENV_NOT_RUNNABLE: u32 = 4;

/// Dispatch a system call made by `cur`.
pub fn dispatch(
    table: &mut EnvTable,
    alloc: &mut PageAllocator,
    cur: EnvId,
    no: u32,
    args: [u32; 5],
) -> Control {
    let call = match Syscall::try_from(no) {
        Ok(call) => call,
        Err(err) => return Control::Return(err.to_errno()),
    };

    let result: Result<u32> = match call {
        Syscall::Cputs => return sys_cputs(table, alloc, cur, args[0], args[1]),
        Syscall::Cgetc => Ok(console::getchar().unwrap_or(0) as u32),
        Syscall::Getenvid => Ok(cur.as_u32()),
        Syscall::EnvDestroy => sys_env_destroy(table, alloc, cur, args[0]),
        Syscall::PageAlloc => sys_page_alloc(table, alloc, cur, args[0], args[1], args[2]),
        Syscall::PageMap => sys_page_map(
            table,
            alloc,
            cur,
            args[0],
            args[1],
            args[2],
            args[3],
            args[4],
        ),
        Syscall::PageUnmap => sys_page_unmap(table, alloc, cur, args[0], args[1]),
        Syscall::Exofork => sys_exofork(table, alloc, cur),
        Syscall::EnvSetStatus => sys_env_set_status(table, cur, args[0], args[1]),
        Syscall::EnvSetTrapframe => sys_env_set_trapframe(table, alloc, cur, args[0], args[1]),
        Syscall::EnvSetPgfaultUpcall => {
            sys_env_set_pgfault_upcall(table, cur, args[0], args[1])
        }
        Syscall::Yield => return Control::Yield,
        Syscall::IpcTrySend => ipc::try_send(
            table,
            alloc,
            cur,
            EnvId(args[0]),
            args[1],
            VirtAddr::new(args[2]),
            args[3],
        )
        .map(|()| 0),
        Syscall::IpcRecv => {
            return match ipc::recv(table, cur, VirtAddr::new(args[0])) {
                // The receiver parked itself; the sender supplies the
                // eventual return value.
                Ok(()) => Control::Yield,
                Err(err) => Control::Return(err.to_errno()),
            };
        }
    };

    match result {
        Ok(value) => Control::Return(value as i32),
        Err(err) => Control::Return(err.to_errno()),
    }
}

/// Print `len` bytes at `va` from the caller's address space to the
/// console. The caller must hold user read permission on the whole
/// range; a violation destroys it.
fn sys_cputs(
    table: &mut EnvTable,
    alloc: &mut PageAllocator,
    cur: EnvId,
    va: u32,
    len: u32,
) -> Control {
    let Ok(env) = table.env(cur) else {
        return Control::Return(KernelError::BadEnv.to_errno());
    };
    let va = VirtAddr::new(va);
    if let Err(addr) = env
        .aspace
        .user_mem_check(alloc, va, len as usize, PteFlags::U)
    {
        println!(
            "[{:08x}] user_mem_check assertion failure for va {:08x}",
            cur, addr
        );
        table.destroy(alloc, cur, cur);
        return Control::Yield;
    }

    let mut buf = alloc::vec![0u8; len as usize];
    table
        .env(cur)
        .expect("cputs: caller vanished")
        .aspace
        .copy_from_user(alloc, va, &mut buf);
    console::write_bytes(&buf);
    Control::Return(0)
}

/// Destroy an environment (the caller itself or one of its children).
fn sys_env_destroy(
    table: &mut EnvTable,
    alloc: &mut PageAllocator,
    cur: EnvId,
    id: u32,
) -> Result<u32> {
    let id = table.resolve(EnvId(id), cur, true)?;
    table.destroy(alloc, id, cur);
    Ok(0)
}

/// Create a blank child: the caller's register state with a zero
/// result, no mappings of its own, `NOT_RUNNABLE` until the parent
/// marks it otherwise. The parent sees the child id; the child, once
/// run, sees zero.
fn sys_exofork(table: &mut EnvTable, alloc: &mut PageAllocator, cur: EnvId) -> Result<u32> {
    let parent_tf = *table.env(cur)?.tf();
    let child = table.alloc(alloc, cur)?;

    let env = table.env_mut(child)?;
    env.tf = parent_tf;
    env.tf.regs.eax = 0;
    env.status = EnvStatus::NotRunnable;
    Ok(child.as_u32())
}

/// Move an environment between `RUNNABLE` and `NOT_RUNNABLE`; no other
/// transition is available from user mode.
fn sys_env_set_status(table: &mut EnvTable, cur: EnvId, id: u32, status: u32) -> Result<u32> {
    let status = match status {
        ENV_RUNNABLE => EnvStatus::Runnable,
        ENV_NOT_RUNNABLE => EnvStatus::NotRunnable,
        _ => return Err(KernelError::Inval),
    };
    let id = table.resolve(EnvId(id), cur, true)?;
    table.env_mut(id)?.status = status;
    Ok(0)
}

/// Replace an environment's saved frame with one read from user
/// memory. The segment selectors, interrupt-enable flag, and I/O
/// privilege level are clamped to user-safe values no matter what the
/// source frame says.
fn sys_env_set_trapframe(
    table: &mut EnvTable,
    alloc: &mut PageAllocator,
    cur: EnvId,
    id: u32,
    tf_va: u32,
) -> Result<u32> {
    use crate::arch::x86::gdt::{GD_UD, GD_UT};

    let id = table.resolve(EnvId(id), cur, true)?;
    let env = table.env(id)?;
    let va = VirtAddr::new(tf_va);
    let size = core::mem::size_of::<Trapframe>();
    env.aspace
        .user_mem_check(alloc, va, size, PteFlags::U)
        .map_err(|_| KernelError::Inval)?;

    let mut buf = [0u8; core::mem::size_of::<Trapframe>()];
    env.aspace.copy_from_user(alloc, va, &mut buf);
    // SAFETY: Trapframe is plain old data; any bit pattern is a valid
    // (if nonsensical) frame, and the clamps below repair the
    // security-relevant fields.
    let mut tf: Trapframe = unsafe { core::ptr::read_unaligned(buf.as_ptr().cast()) };

    tf.ds = GD_UD | 3;
    tf.es = GD_UD | 3;
    tf.ss = GD_UD | 3;
    tf.cs = GD_UT | 3;
    tf.eflags |= EFlags::IF.bits();
    tf.eflags &= !EFlags::IOPL.bits();

    table.env_mut(id)?.tf = tf;
    Ok(0)
}

/// Register (or clear) the page-fault upcall entry point. The pointer
/// is stored without being dereferenced; it is only ever used as a
/// user-mode instruction address.
fn sys_env_set_pgfault_upcall(
    table: &mut EnvTable,
    cur: EnvId,
    id: u32,
    func: u32,
) -> Result<u32> {
    let id = table.resolve(EnvId(id), cur, true)?;
    table.env_mut(id)?.pgfault_upcall = Some(VirtAddr::new(func));
    Ok(0)
}

fn check_user_va(va: VirtAddr) -> Result<()> {
    if va.as_u32() >= UTOP || !va.is_page_aligned() {
        return Err(KernelError::Inval);
    }
    Ok(())
}

fn check_user_perm(perm: u32) -> Result<PteFlags> {
    if !PteFlags::user_perm_ok(perm) {
        return Err(KernelError::Inval);
    }
    Ok(PteFlags::from_bits_truncate(perm))
}

/// Map a zeroed frame at `va` in the target's address space. A failed
/// install frees the fresh frame before reporting `NO_MEM`.
fn sys_page_alloc(
    table: &mut EnvTable,
    alloc: &mut PageAllocator,
    cur: EnvId,
    id: u32,
    va: u32,
    perm: u32,
) -> Result<u32> {
    let va = VirtAddr::new(va);
    check_user_va(va)?;
    let perm = check_user_perm(perm)?;
    let id = table.resolve(EnvId(id), cur, true)?;

    let frame = alloc.alloc(true).ok_or(KernelError::NoMem)?;
    if table
        .env_mut(id)?
        .aspace
        .insert(alloc, frame, va, perm)
        .is_err()
    {
        alloc.free(frame);
        return Err(KernelError::NoMem);
    }
    Ok(0)
}

/// Map the frame behind `src_va` in `src_id`'s space at `dst_va` in
/// `dst_id`'s space. Write permission on the new mapping requires write
/// permission on the source mapping; this is the guard that keeps a
/// read-only grant from being silently upgraded.
#[allow(clippy::too_many_arguments)]
fn sys_page_map(
    table: &mut EnvTable,
    alloc: &mut PageAllocator,
    cur: EnvId,
    src_id: u32,
    src_va: u32,
    dst_id: u32,
    dst_va: u32,
    perm: u32,
) -> Result<u32> {
    let src_va = VirtAddr::new(src_va);
    let dst_va = VirtAddr::new(dst_va);
    check_user_va(src_va)?;
    check_user_va(dst_va)?;
    let perm = check_user_perm(perm)?;

    let src_id = table.resolve(EnvId(src_id), cur, true)?;
    let dst_id = table.resolve(EnvId(dst_id), cur, true)?;

    let (ppn, src_flags) = table
        .env(src_id)?
        .aspace
        .lookup(alloc, src_va)
        .ok_or(KernelError::Inval)?;
    if perm.contains(PteFlags::W) && !src_flags.contains(PteFlags::W) {
        return Err(KernelError::Inval);
    }

    table
        .env_mut(dst_id)?
        .aspace
        .insert(alloc, ppn, dst_va, perm)
        .map(|()| 0)
        .map_err(|_| KernelError::NoMem)
}

/// Drop the mapping at `va`, if any; unmapping an unmapped page is a
/// successful no-op.
fn sys_page_unmap(
    table: &mut EnvTable,
    alloc: &mut PageAllocator,
    cur: EnvId,
    id: u32,
    va: u32,
) -> Result<u32> {
    let va = VirtAddr::new(va);
    check_user_va(va)?;
    let id = table.resolve(EnvId(id), cur, true)?;
    table.env_mut(id)?.aspace.remove(alloc, va);
    Ok(0)
}
