//! Hardware entry stubs
//!
//! One stub per vector. A stub pushes a zero placeholder when the
//! hardware does not supply an error code, pushes its vector number,
//! and jumps to the common tail, which completes the `Trapframe` the
//! dispatcher reads: segment registers, then `pusha`, then the kernel
//! data selector into DS/ES, then the frame pointer as the single C
//! argument. Any change to the push sequence must be mirrored in
//! `trap::frame`, whose layout tests pin the offsets.

// Vectors 8, 10-14, and 17 get an error code from the processor; the
// rest get the zero placeholder. 0x10 below is GD_KD.
core::arch::global_asm!(
    r#"
    .section .text
    .altmacro

    .macro vector num
      .align 4
    vector\num:
      .if !((\num == 8) || ((\num >= 10) && (\num <= 14)) || (\num == 17))
        pushl $0
      .endif
      pushl $\num
      jmp alltraps
    .endm

    .set i, 0
    .rept 256
      vector %i
      .set i, i + 1
    .endr

    .align 4
    alltraps:
      pushl %ds
      pushl %es
      pushal
      movw $0x10, %ax
      movw %ax, %ds
      movw %ax, %es
      pushl %esp
      call trap_entry
      /* trap_entry never returns */

    .macro vaddr num
      .long vector\num
    .endm

    .section .rodata
    .globl trap_vectors
    .align 4
    trap_vectors:
    .set i, 0
    .rept 256
      vaddr %i
      .set i, i + 1
    .endr
    "#,
    options(att_syntax)
);

extern "C" {
    static trap_vectors: [u32; 256];
}

/// Entry addresses of the per-vector stubs, indexed by vector number.
pub fn vector_table() -> &'static [u32; 256] {
    // SAFETY: trap_vectors is a fully initialized read-only table
    // emitted by the assembly above.
    unsafe { &trap_vectors }
}

/// Restore a saved trap frame and return to the environment with
/// `iret`. This is the only exit from kernel to user mode.
///
/// # Safety
///
/// `tf` must point to a complete, valid trap frame whose code selector
/// has RPL 3 (or RPL 0 with a matching kernel stack); the address space
/// holding `eip`/`esp` must be loaded.
pub unsafe fn pop_trapframe(tf: *const crate::trap::Trapframe) -> ! {
    // SAFETY: contract passed through from the caller.
    unsafe {
        core::arch::asm!(
            "mov esp, {tf}",
            "popad",
            "pop es",
            "pop ds",
            "add esp, 8", // skip trapno and err
            "iretd",
            tf = in(reg) tf,
            options(noreturn),
        );
    }
}
