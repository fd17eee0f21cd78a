//! Trap and interrupt dispatch
//!
//! Everything enters the kernel through the per-vector stubs, which
//! build a `Trapframe` and call `trap_entry` with interrupts disabled.
//! The dispatcher locks the kernel, snapshots user frames into the
//! environment, routes by vector, and finishes by resuming the current
//! environment or handing the CPU to the scheduler.

pub mod frame;
pub mod pgfault;

pub use frame::{EFlags, PushRegs, Trapframe, UTrapframe};

// Trap numbers. 0-19 are processor-defined.
pub const T_DIVIDE: u32 = 0; // divide error
pub const T_DEBUG: u32 = 1; // debug exception
pub const T_NMI: u32 = 2; // non-maskable interrupt
pub const T_BRKPT: u32 = 3; // breakpoint
pub const T_OFLOW: u32 = 4; // overflow
pub const T_BOUND: u32 = 5; // bounds check
pub const T_ILLOP: u32 = 6; // illegal opcode
pub const T_DEVICE: u32 = 7; // device not available
pub const T_DBLFLT: u32 = 8; // double fault
pub const T_TSS: u32 = 10; // invalid task switch segment
pub const T_SEGNP: u32 = 11; // segment not present
pub const T_STACK: u32 = 12; // stack exception
pub const T_GPFLT: u32 = 13; // general protection fault
pub const T_PGFLT: u32 = 14; // page fault
pub const T_FPERR: u32 = 16; // x87 floating-point error
pub const T_ALIGN: u32 = 17; // alignment check
pub const T_MCHK: u32 = 18; // machine check
pub const T_SIMDERR: u32 = 19; // SIMD floating-point error

/// Software-interrupt vector for system calls; chosen clear of the
/// processor exceptions and the hardware IRQ block.
pub const T_SYSCALL: u32 = 48;

// Hardware IRQs arrive at IRQ_OFFSET + IRQ_n.
pub const IRQ_OFFSET: u32 = 32;
pub const IRQ_TIMER: u32 = 0;
pub const IRQ_KBD: u32 = 1;
pub const IRQ_SERIAL: u32 = 4;
pub const IRQ_SPURIOUS: u32 = 7;
pub const IRQ_IDE: u32 = 14;
pub const IRQ_ERROR: u32 = 19;

pub fn trapname(trapno: u32) -> &'static str {
    match trapno {
        T_DIVIDE => "Divide error",
        T_DEBUG => "Debug",
        T_NMI => "Non-Maskable Interrupt",
        T_BRKPT => "Breakpoint",
        T_OFLOW => "Overflow",
        T_BOUND => "BOUND Range Exceeded",
        T_ILLOP => "Invalid Opcode",
        T_DEVICE => "Device Not Available",
        T_DBLFLT => "Double Fault",
        T_TSS => "Invalid TSS",
        T_SEGNP => "Segment Not Present",
        T_STACK => "Stack Fault",
        T_GPFLT => "General Protection",
        T_PGFLT => "Page Fault",
        T_FPERR => "x87 FPU Floating-Point Error",
        T_ALIGN => "Alignment Check",
        T_MCHK => "Machine-Check",
        T_SIMDERR => "SIMD Floating-Point Exception",
        T_SYSCALL => "System call",
        n if (IRQ_OFFSET..IRQ_OFFSET + 16).contains(&n) => "Hardware Interrupt",
        _ => "(unknown trap)",
    }
}

/// Where a vector is routed once the frame is saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Reflect to the environment's page-fault upcall (user mode);
    /// fatal from kernel mode
    PageFault,
    /// Drop into the interactive monitor
    Monitor,
    /// System-call dispatch
    Syscall,
    /// Clock tick: acknowledge and reschedule
    Timer,
    /// Log and ignore
    Spurious,
    /// Console keyboard handler
    Keyboard,
    /// Console serial handler
    Serial,
    /// No handler: fatal from kernel mode, destroys a user environment
    Unexpected,
}

/// The routing table of the dispatcher.
pub fn route(trapno: u32) -> Route {
    match trapno {
        T_PGFLT => Route::PageFault,
        T_BRKPT | T_DEBUG => Route::Monitor,
        T_SYSCALL => Route::Syscall,
        n if n == IRQ_OFFSET + IRQ_TIMER => Route::Timer,
        n if n == IRQ_OFFSET + IRQ_SPURIOUS => Route::Spurious,
        n if n == IRQ_OFFSET + IRQ_KBD => Route::Keyboard,
        n if n == IRQ_OFFSET + IRQ_SERIAL => Route::Serial,
        _ => Route::Unexpected,
    }
}

/// Dump a trap frame to the console, in the format the rest of the
/// tooling greps for.
pub fn print_trapframe(tf: &Trapframe) {
    println!("TRAP frame at {:p}", tf as *const Trapframe);
    print_regs(&tf.regs);
    println!("  es    0x----{:04x}", tf.es);
    println!("  ds    0x----{:04x}", tf.ds);
    println!("  trap  0x{:08x} {}", tf.trapno, trapname(tf.trapno));
    print!("  err   0x{:08x}", tf.err);
    if tf.trapno == T_PGFLT {
        // Decoded page-fault error code: user/kernel, read/write,
        // protection/not-present.
        println!(
            " [{}, {}, {}]",
            if tf.err & 4 != 0 { "user" } else { "kernel" },
            if tf.err & 2 != 0 { "write" } else { "read" },
            if tf.err & 1 != 0 { "protection" } else { "not-present" }
        );
    } else {
        println!();
    }
    println!("  eip   0x{:08x}", tf.eip);
    println!("  cs    0x----{:04x}", tf.cs);
    println!("  flags 0x{:08x}", tf.eflags);
    if tf.from_user() {
        println!("  esp   0x{:08x}", tf.esp);
        println!("  ss    0x----{:04x}", tf.ss);
    }
}

fn print_regs(regs: &PushRegs) {
    println!("  edi   0x{:08x}", regs.edi);
    println!("  esi   0x{:08x}", regs.esi);
    println!("  ebp   0x{:08x}", regs.ebp);
    println!("  oesp  0x{:08x}", regs.oesp);
    println!("  ebx   0x{:08x}", regs.ebx);
    println!("  edx   0x{:08x}", regs.edx);
    println!("  ecx   0x{:08x}", regs.ecx);
    println!("  eax   0x{:08x}", regs.eax);
}

/// Build the shared IDT. Boot CPU only, before the APs come up.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    crate::arch::x86::idt::init();
    init_percpu();
}

/// Per-CPU trap state: bind this CPU's kernel stack in its task state,
/// install and load its task-state descriptor, and load the shared IDT.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init_percpu() {
    use crate::arch::x86::gdt;
    use crate::cpu;

    let index = cpu::cpu_index();
    let cpu = cpu::this_cpu();

    // SAFETY: this is the owning CPU, at bring-up, before its first
    // trap.
    let ts = unsafe { cpu.init_task_state(cpu::kstack_top(index), gdt::GD_KD) };
    gdt::load_tss(index, ts);
    crate::arch::x86::idt::load();
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod entry {
    use super::*;
    use crate::cpu::{self, CpuStatus};
    use crate::env::{self, EnvId, EnvStatus};
    use crate::mm::{page_allocator, VirtAddr};
    use crate::sync::KERNEL_LOCK;
    use crate::syscall::{self, Control};
    use crate::{arch, console, monitor, sched};

    /// C-level entry from the stubs. Interrupts are disabled; the
    /// frame lives on this CPU's kernel stack.
    #[no_mangle]
    extern "C" fn trap_entry(tf: *mut Trapframe) -> ! {
        arch::x86::cld();
        assert_eq!(
            arch::x86::read_eflags() & EFlags::IF.bits(),
            0,
            "interrupts enabled on kernel entry"
        );

        let cpu = cpu::this_cpu();
        // A CPU waking from the scheduler's halt loop re-enters the
        // kernel here and must retake the lock it released.
        if cpu.exchange_status(CpuStatus::Started) == CpuStatus::Halted {
            KERNEL_LOCK.lock();
        }

        // SAFETY: the stub hands us the frame it just built.
        let stack_tf = unsafe { &mut *tf };

        if stack_tf.from_user() {
            KERNEL_LOCK.lock();
            let cur = cpu
                .cur_env()
                .expect("trap from user mode with no current environment");

            let mut table = env::env_table();
            if table.get(cur).map(|env| env.status()) == Some(EnvStatus::Dying) {
                // Deferred reap: the environment was condemned while
                // running here.
                let mut alloc = page_allocator();
                table.free(&mut alloc, cur, cur);
                cpu.set_cur_env(None);
                drop(alloc);
                drop(table);
                sched::sched_yield();
            }

            // Snapshot the stack frame; from here on the environment's
            // saved copy is authoritative.
            table
                .get_mut(cur)
                .expect("current environment vanished")
                .tf = *stack_tf;
            drop(table);

            dispatch_user(cur, stack_tf.trapno);
        } else {
            dispatch_kernel(stack_tf);
        }

        // Return to the current environment if it is still running;
        // otherwise give the CPU away.
        let table = env::env_table();
        if let Some(cur) = cpu.cur_env() {
            if table.get(cur).map(|env| env.status()) == Some(EnvStatus::Running) {
                sched::env_run(table, cur);
            }
        }
        drop(table);
        sched::sched_yield()
    }

    /// Traps taken in user mode, after the frame snapshot.
    fn dispatch_user(cur: EnvId, trapno: u32) {
        match route(trapno) {
            Route::PageFault => {
                // SAFETY: CR2 read has no side effects.
                let fault_va = VirtAddr::new(unsafe { x86::controlregs::cr2() } as u32);
                let mut table = env::env_table();
                let mut alloc = page_allocator();
                pgfault::reflect(&mut table, &mut alloc, cur, fault_va);
            }
            Route::Monitor => {
                let table = env::env_table();
                let tf = *table.get(cur).expect("monitor: no environment").tf();
                drop(table);
                monitor::run(Some(&tf));
            }
            Route::Syscall => {
                let mut table = env::env_table();
                let mut alloc = page_allocator();
                let regs = table.get(cur).expect("syscall: no environment").tf().regs;
                let control = syscall::dispatch(
                    &mut table,
                    &mut alloc,
                    cur,
                    regs.eax,
                    [regs.edx, regs.ecx, regs.ebx, regs.edi, regs.esi],
                );
                if let Control::Return(value) = control {
                    if let Some(env) = table.get_mut(cur) {
                        env.tf_mut().regs.eax = value as u32;
                    }
                }
            }
            Route::Timer => {
                arch::x86::lapic::eoi();
                sched::sched_yield();
            }
            Route::Spurious => {
                log::warn!("spurious interrupt on irq {}", IRQ_SPURIOUS);
            }
            Route::Keyboard => {
                console::kbd_intr();
                arch::x86::lapic::eoi();
            }
            Route::Serial => {
                console::serial_intr();
                arch::x86::lapic::eoi();
            }
            Route::Unexpected => {
                // The environment did something unhandleable.
                let mut table = env::env_table();
                let mut alloc = page_allocator();
                if let Some(env) = table.get(cur) {
                    print_trapframe(env.tf());
                }
                table.destroy(&mut alloc, cur, cur);
            }
        }
    }

    /// Traps taken in kernel mode. Only the clock (waking a halted
    /// CPU), console interrupts, and breakpoints are survivable.
    fn dispatch_kernel(tf: &Trapframe) {
        match route(tf.trapno) {
            Route::Timer => {
                arch::x86::lapic::eoi();
                sched::sched_yield();
            }
            Route::Spurious => {
                log::warn!("spurious interrupt on irq {}", IRQ_SPURIOUS);
            }
            Route::Keyboard => {
                console::kbd_intr();
                arch::x86::lapic::eoi();
            }
            Route::Serial => {
                console::serial_intr();
                arch::x86::lapic::eoi();
            }
            Route::Monitor => monitor::run(Some(tf)),
            Route::PageFault | Route::Syscall | Route::Unexpected => {
                print_trapframe(tf);
                panic!("unhandled trap {} in kernel", trapname(tf.trapno));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_table_matches_contract() {
        assert_eq!(route(T_PGFLT), Route::PageFault);
        assert_eq!(route(T_BRKPT), Route::Monitor);
        assert_eq!(route(T_DEBUG), Route::Monitor);
        assert_eq!(route(T_SYSCALL), Route::Syscall);
        assert_eq!(route(IRQ_OFFSET + IRQ_TIMER), Route::Timer);
        assert_eq!(route(IRQ_OFFSET + IRQ_SPURIOUS), Route::Spurious);
        assert_eq!(route(IRQ_OFFSET + IRQ_KBD), Route::Keyboard);
        assert_eq!(route(IRQ_OFFSET + IRQ_SERIAL), Route::Serial);
        // Everything else is unexpected and ends the offender.
        for n in [T_DIVIDE, T_GPFLT, T_DBLFLT, 49, 200] {
            assert_eq!(route(n), Route::Unexpected, "vector {}", n);
        }
    }

    #[test]
    fn trap_names_cover_the_vectors() {
        assert_eq!(trapname(T_PGFLT), "Page Fault");
        assert_eq!(trapname(T_SYSCALL), "System call");
        assert_eq!(trapname(IRQ_OFFSET + 3), "Hardware Interrupt");
        assert_eq!(trapname(255), "(unknown trap)");
    }
}
