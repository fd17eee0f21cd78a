//! Scheduler
//!
//! Round-robin selection over the environment table (the scan policy
//! itself lives with the table and is tested there). `env_run` is the
//! only path back to user mode: it publishes the pick in the per-CPU
//! record, loads the environment's page directory, releases the big
//! kernel lock, and restores the saved trap frame.

#![cfg(all(target_arch = "x86", target_os = "none"))]

use spin::MutexGuard;

use crate::cpu::{self, CpuStatus};
use crate::env::{self, EnvId, EnvStatus, EnvTable};
use crate::sync::KERNEL_LOCK;
use crate::trap::Trapframe;
use crate::{arch, monitor};

/// Pick a runnable environment and switch to it; halt the CPU when
/// there is nothing to run.
pub fn sched_yield() -> ! {
    let table = env::env_table();
    match table.find_runnable(cpu::this_cpu().cur_env()) {
        Some(id) => env_run(table, id),
        None => sched_halt(table),
    }
}

/// Context switch into `id`. Consumes the table guard: the guard drops
/// before the lock release and the final frame restore.
pub fn env_run(mut table: MutexGuard<'_, EnvTable>, id: EnvId) -> ! {
    let cpu = cpu::this_cpu();

    if let Some(cur) = cpu.cur_env() {
        if let Some(env) = table.get_mut(cur) {
            if env.status == EnvStatus::Running {
                env.status = EnvStatus::Runnable;
            }
        }
    }

    let env = table.get_mut(id).expect("env_run: vanished environment");
    env.status = EnvStatus::Running;
    env.runs += 1;
    let tf = env.tf() as *const Trapframe;
    let pdir = env.aspace.pdir_ppn().addr();

    cpu.set_cur_env(Some(id));
    arch::x86::load_pgdir(pdir);

    drop(table);
    KERNEL_LOCK.unlock();

    // SAFETY: the frame was saved on a prior kernel entry (or seeded by
    // the loader) and its address space is now loaded.
    unsafe { arch::x86::stubs::pop_trapframe(tf) }
}

/// Nothing runnable: drop the kernel and park until an interrupt gives
/// us work. With no environments left at all, hand the console to the
/// monitor instead.
fn sched_halt(table: MutexGuard<'_, EnvTable>) -> ! {
    if table.live_count() == 0 {
        drop(table);
        log::info!("no runnable environments; entering monitor");
        monitor::enter();
    }

    let cpu = cpu::this_cpu();
    cpu.set_cur_env(None);
    cpu.set_status(CpuStatus::Halted);
    drop(table);
    KERNEL_LOCK.unlock();

    // Reset to the top of this CPU's stack; nothing below us can ever
    // be returned to. The next interrupt lands in trap_entry, which
    // sees the HALTED -> STARTED edge and retakes the lock.
    let stack_top = cpu::kstack_top(cpu::cpu_index()).as_u32();
    // SAFETY: the stack reset discards only dead frames, and the sti/
    // hlt loop never touches memory.
    unsafe {
        core::arch::asm!(
            "mov esp, {stack}",
            "xor ebp, ebp",
            "sti",
            "2:",
            "hlt",
            "jmp 2b",
            stack = in(reg) stack_top,
            options(noreturn),
        )
    }
}
