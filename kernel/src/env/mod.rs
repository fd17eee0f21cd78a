//! User environments
//!
//! An environment is a user-mode execution context: an address space, a
//! saved trap frame, a parent link, and the IPC mailbox. Environments
//! live in a fixed table guarded by a spin mutex; identifiers encode a
//! generation above the slot index so a stale id never resolves to a
//! recycled slot.

pub mod embedded;
pub mod load;

use core::fmt;

use spin::{Mutex, MutexGuard};

use crate::error::{KernelError, Result};
use crate::mm::{AddressSpace, PageAllocator, VirtAddr};
use crate::trap::Trapframe;

/// Maximum number of live environments
pub const NENV: usize = 1024;
const LOG2NENV: u32 = 10;
/// Id bits below this shift hold the slot; bits above it the generation
const ENVGENSHIFT: u32 = 12;

/// Environment identifier. Id 0 names the kernel itself and, as a
/// syscall argument, "the caller".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvId(pub u32);

impl EnvId {
    pub const KERNEL: EnvId = EnvId(0);

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    fn slot(&self) -> usize {
        self.0 as usize & (NENV - 1)
    }
}

impl fmt::LowerHex for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Environment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    /// Marked for destruction; reaped on the next kernel entry that
    /// finds it current
    Dying,
    Runnable,
    Running,
    NotRunnable,
}

/// One user environment.
#[derive(Debug)]
pub struct Env {
    id: EnvId,
    pub(crate) parent_id: EnvId,
    pub(crate) status: EnvStatus,
    /// Number of times this environment has been dispatched
    pub(crate) runs: u32,
    /// Saved CPU state; restored by the scheduler on dispatch
    pub(crate) tf: Trapframe,
    pub(crate) aspace: AddressSpace,
    /// Registered page-fault upcall entry point, if any
    pub(crate) pgfault_upcall: Option<VirtAddr>,

    // IPC mailbox
    /// Blocked in ipc_recv waiting for a sender
    pub(crate) ipc_recving: bool,
    /// Where the receiver wants an incoming page mapped; `>= UTOP`
    /// means "no page, value only"
    pub(crate) ipc_dstva: VirtAddr,
    /// Sender of the last delivered message
    pub(crate) ipc_from: EnvId,
    /// Value of the last delivered message
    pub(crate) ipc_value: u32,
    /// Permissions of the page transferred with the last message, 0 if
    /// none
    pub(crate) ipc_perm: u32,
}

impl Env {
    pub fn id(&self) -> EnvId {
        self.id
    }

    pub fn status(&self) -> EnvStatus {
        self.status
    }

    pub fn tf(&self) -> &Trapframe {
        &self.tf
    }

    pub fn tf_mut(&mut self) -> &mut Trapframe {
        &mut self.tf
    }

    /// Times this environment has been dispatched.
    pub fn runs(&self) -> u32 {
        self.runs
    }

    /// The IPC mailbox after a delivery: sender, value, and the
    /// permissions of the transferred page (zero when none).
    pub fn ipc_received(&self) -> (EnvId, u32, u32) {
        (self.ipc_from, self.ipc_value, self.ipc_perm)
    }
}

/// The table of environments.
pub struct EnvTable {
    envs: [Option<Env>; NENV],
    /// Last id handed out per slot, for generation bumping
    last_id: [u32; NENV],
}

impl EnvTable {
    pub const fn new() -> Self {
        Self {
            envs: [const { None }; NENV],
            last_id: [0; NENV],
        }
    }

    fn generate_id(&mut self, slot: usize) -> EnvId {
        let mut generation =
            (self.last_id[slot] + (1 << ENVGENSHIFT)) & !((1 << LOG2NENV) - 1);
        if generation == 0 {
            generation = 1 << ENVGENSHIFT;
        }
        let id = generation | slot as u32;
        self.last_id[slot] = id;
        EnvId(id)
    }

    /// Allocate a fresh environment in `NOT_RUNNABLE` status: a new
    /// address space and a user-mode trap frame with the entry point
    /// left unset.
    pub fn alloc(&mut self, alloc: &mut PageAllocator, parent: EnvId) -> Result<EnvId> {
        let slot = self
            .envs
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::NoFreeEnv)?;

        let aspace = AddressSpace::new(alloc)?;
        let id = self.generate_id(slot);

        self.envs[slot] = Some(Env {
            id,
            parent_id: parent,
            status: EnvStatus::NotRunnable,
            runs: 0,
            tf: Trapframe::new_user(),
            aspace,
            pgfault_upcall: None,
            ipc_recving: false,
            ipc_dstva: VirtAddr::new(0),
            ipc_from: EnvId::KERNEL,
            ipc_value: 0,
            ipc_perm: 0,
        });

        Ok(id)
    }

    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.envs[id.slot()].as_ref().filter(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs[id.slot()].as_mut().filter(|e| e.id == id)
    }

    /// Resolve `id` on behalf of `caller`: 0 means the caller itself; a
    /// dangling or recycled id is `BAD_ENV`; with `check_perm`, acting
    /// on an environment that is neither the caller nor one of its
    /// direct children is also `BAD_ENV`.
    pub fn resolve(&self, id: EnvId, caller: EnvId, check_perm: bool) -> Result<EnvId> {
        if id == EnvId::KERNEL {
            return Ok(caller);
        }
        let env = self.get(id).ok_or(KernelError::BadEnv)?;
        if check_perm && id != caller && env.parent_id != caller {
            return Err(KernelError::BadEnv);
        }
        Ok(id)
    }

    /// Like `get`, but with the syscall error convention.
    pub fn env(&self, id: EnvId) -> Result<&Env> {
        self.get(id).ok_or(KernelError::BadEnv)
    }

    pub fn env_mut(&mut self, id: EnvId) -> Result<&mut Env> {
        self.get_mut(id).ok_or(KernelError::BadEnv)
    }

    /// Free `id` outright: tear down its address space and release the
    /// slot. `cur` only labels the console diagnostic.
    pub fn free(&mut self, alloc: &mut PageAllocator, id: EnvId, cur: EnvId) {
        let env = self.envs[id.slot()]
            .take()
            .expect("free of missing environment");
        assert_eq!(env.id, id, "free of stale environment id");

        println!("[{:08x}] free env {:08x}", cur, id);
        env.aspace.teardown(alloc);
    }

    /// Destroy `id`. An environment running on another CPU is only
    /// marked `DYING`; it is reaped on its next kernel entry. Returns
    /// true when the caller destroyed itself and must yield instead of
    /// returning to user mode.
    pub fn destroy(&mut self, alloc: &mut PageAllocator, id: EnvId, cur: EnvId) -> bool {
        let is_self = id == cur;
        let env = match self.get_mut(id) {
            Some(env) => env,
            None => return false,
        };

        if env.status == EnvStatus::Running && !is_self {
            env.status = EnvStatus::Dying;
            return false;
        }

        self.free(alloc, id, cur);
        if is_self {
            crate::cpu::this_cpu().set_cur_env(None);
        }
        is_self
    }

    /// Round-robin pick: the first `RUNNABLE` environment scanning
    /// circularly from just past `last`; falls back to `last` itself if
    /// it is still `RUNNING` on this CPU.
    pub fn find_runnable(&self, last: Option<EnvId>) -> Option<EnvId> {
        let start = last.map_or(0, |id| id.slot() + 1);
        for i in 0..NENV {
            let slot = (start + i) % NENV;
            if let Some(env) = &self.envs[slot] {
                if env.status == EnvStatus::Runnable {
                    return Some(env.id);
                }
            }
        }
        last.filter(|&id| {
            self.get(id)
                .is_some_and(|env| env.status == EnvStatus::Running)
        })
    }

    /// Number of live environments (any status).
    pub fn live_count(&self) -> usize {
        self.envs.iter().filter(|e| e.is_some()).count()
    }
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}

static ENV_TABLE: Mutex<EnvTable> = Mutex::new(EnvTable::new());

/// The global environment table. Callers must hold the big kernel lock;
/// the mutex is belt and braces against misuse.
pub fn env_table() -> MutexGuard<'static, EnvTable> {
    ENV_TABLE.lock()
}
