//! Per-CPU state
//!
//! One record per processor: the task-state area holding the kernel
//! stack pointer for the privilege transition, the identity of the
//! environment the CPU is running, and the halted/started status word
//! the dispatcher exchanges on entry. Each CPU owns a dedicated,
//! non-overlapping kernel-stack slot below `KSTACKTOP`.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::x86::gdt::TaskState;
use crate::env::EnvId;
use crate::mm::{VirtAddr, KSTACKTOP, KSTKGAP, KSTKSIZE};

/// Maximum number of CPUs
pub const NCPU: usize = 8;

/// Processor lifecycle status
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStatus {
    /// Never started, or parked in the scheduler with no work
    Halted = 0,
    /// Executing (kernel or user) since its last wakeup
    Started = 1,
}

/// One processor's kernel-private record.
pub struct Cpu {
    id: u8,
    status: AtomicU32,
    /// Id of the environment this CPU is running, 0 when none.
    cur_env: AtomicU32,
    /// Task-state segment; written only by the owning CPU, once, at
    /// bring-up.
    ts: UnsafeCell<TaskState>,
}

// SAFETY: `status` and `cur_env` are atomics; `ts` is written only by
// the owning CPU before it takes its first trap and read only by the
// hardware of that CPU afterwards.
unsafe impl Sync for Cpu {}

impl Cpu {
    pub const fn new(id: u8) -> Self {
        Self {
            id,
            status: AtomicU32::new(CpuStatus::Halted as u32),
            cur_env: AtomicU32::new(0),
            ts: UnsafeCell::new(TaskState::new()),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    /// Atomically replace the status word, returning the prior value.
    /// The dispatcher uses the `Halted` -> `Started` edge to decide
    /// whether it must take the big kernel lock.
    pub fn exchange_status(&self, new: CpuStatus) -> CpuStatus {
        match self.status.swap(new as u32, Ordering::AcqRel) {
            0 => CpuStatus::Halted,
            _ => CpuStatus::Started,
        }
    }

    pub fn set_status(&self, status: CpuStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    /// The environment this CPU is currently running.
    pub fn cur_env(&self) -> Option<EnvId> {
        match self.cur_env.load(Ordering::Acquire) {
            0 => None,
            raw => Some(EnvId(raw)),
        }
    }

    pub fn set_cur_env(&self, env: Option<EnvId>) {
        self.cur_env
            .store(env.map_or(0, |id| id.0), Ordering::Release);
    }

    /// Bind this CPU's ring-0 entry stack in its task state and return
    /// the task-state record for GDT installation.
    ///
    /// # Safety
    ///
    /// Must be called only by the CPU that owns this record, before it
    /// loads the task register.
    pub unsafe fn init_task_state(&self, esp0: VirtAddr, ss0: u16) -> &'static TaskState {
        // SAFETY: per the function contract there is exactly one writer
        // and no concurrent reader yet.
        unsafe {
            let ts = &mut *self.ts.get();
            ts.set_kernel_stack(esp0, ss0);
            &*(ts as *const TaskState)
        }
    }
}

/// Top of CPU `i`'s kernel stack: stacks and their unmapped guard gaps
/// descend from `KSTACKTOP`.
pub fn kstack_top(cpu: usize) -> VirtAddr {
    assert!(cpu < NCPU);
    VirtAddr::new(KSTACKTOP - (cpu * (KSTKSIZE + KSTKGAP)) as u32)
}

static CPUS: [Cpu; NCPU] = [
    Cpu::new(0),
    Cpu::new(1),
    Cpu::new(2),
    Cpu::new(3),
    Cpu::new(4),
    Cpu::new(5),
    Cpu::new(6),
    Cpu::new(7),
];

/// Index of the calling CPU.
pub fn cpu_index() -> usize {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        crate::arch::x86::lapic::id() as usize % NCPU
    }
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    {
        0
    }
}

/// The calling CPU's record.
pub fn this_cpu() -> &'static Cpu {
    &CPUS[cpu_index()]
}

pub fn cpus() -> &'static [Cpu; NCPU] {
    &CPUS
}
