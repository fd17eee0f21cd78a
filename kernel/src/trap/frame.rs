//! Trap frame layout
//!
//! The `Trapframe` layout is shared with the hand-written entry stubs in
//! `arch::x86::stubs`: the stub tail pushes segment registers and then
//! `pusha`, so field order, width, and padding here must match the push
//! sequence exactly. The layout tests below pin every offset.

use crate::arch::x86::gdt::{GD_UD, GD_UT};
use crate::mm::{VirtAddr, USTACKTOP};

bitflags::bitflags! {
    /// EFLAGS register bits the kernel cares about
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EFlags: u32 {
        /// Interrupt enable
        const IF = 1 << 9;
        /// I/O privilege level (two bits)
        const IOPL = 0x3000;
    }
}

/// General-purpose registers in the order `pusha` stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// `esp` as saved by `pusha`; ignored by `popa`
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// CPU state captured at kernel entry.
///
/// Fields from `trapno` down to `eflags` mirror what the stubs and the
/// processor push; `esp`/`ss` are present only when the trap crossed a
/// privilege boundary, which for frames the dispatcher snapshots is
/// always the case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub es: u16,
    pub padding1: u16,
    pub ds: u16,
    pub padding2: u16,
    pub trapno: u32,
    // Pushed by x86 hardware (or the zero placeholder in the stub):
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub padding3: u16,
    pub eflags: u32,
    // Only when crossing rings:
    pub esp: u32,
    pub ss: u16,
    pub padding4: u16,
}

impl Trapframe {
    pub const fn new() -> Self {
        // Can't use Default in const context.
        Self {
            regs: PushRegs {
                edi: 0,
                esi: 0,
                ebp: 0,
                oesp: 0,
                ebx: 0,
                edx: 0,
                ecx: 0,
                eax: 0,
            },
            es: 0,
            padding1: 0,
            ds: 0,
            padding2: 0,
            trapno: 0,
            err: 0,
            eip: 0,
            cs: 0,
            padding3: 0,
            eflags: 0,
            esp: 0,
            ss: 0,
            padding4: 0,
        }
    }

    /// Initial frame for a fresh user environment: user segments with
    /// RPL 3, stack at `USTACKTOP`, interrupts enabled, IOPL 0. The
    /// entry point is filled in later.
    pub fn new_user() -> Self {
        let mut tf = Self::new();
        tf.ds = GD_UD | 3;
        tf.es = GD_UD | 3;
        tf.ss = GD_UD | 3;
        tf.cs = GD_UT | 3;
        tf.esp = USTACKTOP;
        tf.eflags = EFlags::IF.bits();
        tf
    }

    /// Did this frame originate in user mode? (RPL of the saved code
    /// selector is 3.)
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    pub fn set_entry_point(&mut self, va: VirtAddr) {
        self.eip = va.as_u32();
    }
}

/// Frame delivered to a user-mode page-fault handler on the exception
/// stack. The user-side return trampoline depends on this exact layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct UTrapframe {
    pub fault_va: u32,
    pub err: u32,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl UTrapframe {
    /// Snapshot the fault state out of a kernel trap frame.
    pub fn from_trapframe(tf: &Trapframe, fault_va: VirtAddr) -> Self {
        Self {
            fault_va: fault_va.as_u32(),
            err: tf.err,
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        }
    }

    /// Raw bytes of the frame, for copying onto the exception stack.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: UTrapframe is repr(C) with no padding and no invalid
        // bit patterns.
        unsafe {
            core::slice::from_raw_parts(
                self as *const Self as *const u8,
                core::mem::size_of::<Self>(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn trapframe_layout_matches_entry_stubs() {
        // The stub tail and `iret` read the frame at these exact
        // offsets; a change here is register corruption on the first
        // trap.
        assert_eq!(size_of::<PushRegs>(), 32);
        assert_eq!(size_of::<Trapframe>(), 0x44);
        assert_eq!(offset_of!(Trapframe, regs), 0x00);
        assert_eq!(offset_of!(Trapframe, es), 0x20);
        assert_eq!(offset_of!(Trapframe, ds), 0x24);
        assert_eq!(offset_of!(Trapframe, trapno), 0x28);
        assert_eq!(offset_of!(Trapframe, err), 0x2c);
        assert_eq!(offset_of!(Trapframe, eip), 0x30);
        assert_eq!(offset_of!(Trapframe, cs), 0x34);
        assert_eq!(offset_of!(Trapframe, eflags), 0x38);
        assert_eq!(offset_of!(Trapframe, esp), 0x3c);
        assert_eq!(offset_of!(Trapframe, ss), 0x40);
    }

    #[test]
    fn utrapframe_layout_matches_user_trampoline() {
        assert_eq!(size_of::<UTrapframe>(), 0x34);
        assert_eq!(offset_of!(UTrapframe, fault_va), 0x00);
        assert_eq!(offset_of!(UTrapframe, err), 0x04);
        assert_eq!(offset_of!(UTrapframe, regs), 0x08);
        assert_eq!(offset_of!(UTrapframe, eip), 0x28);
        assert_eq!(offset_of!(UTrapframe, eflags), 0x2c);
        assert_eq!(offset_of!(UTrapframe, esp), 0x30);
    }

    #[test]
    fn new_user_frame_invariants() {
        let tf = Trapframe::new_user();
        assert!(tf.from_user());
        assert_eq!(tf.cs & 3, 3);
        assert_eq!(tf.ss & 3, 3);
        assert!(EFlags::from_bits_truncate(tf.eflags).contains(EFlags::IF));
        assert!(!EFlags::from_bits_truncate(tf.eflags).intersects(EFlags::IOPL));
        assert_eq!(tf.esp, USTACKTOP);
    }
}
