//! Global descriptor table and task-state segments
//!
//! Flat 4-GiB code/data segments for each privilege level (segmentation
//! is only used to switch rings) plus one task-state descriptor per
//! CPU. Each CPU writes exactly its own TSS slot, once, at bring-up;
//! loading the same TSS on two CPUs ends in a triple fault.

// Descriptor encodings -- several helpers are only reachable from the
// bare-metal loaders and the tests.
#![allow(dead_code)]

use crate::cpu::NCPU;
use crate::mm::VirtAddr;

// Segment selectors. The low two bits of a loaded selector carry the
// requestor privilege level.
pub const GD_KT: u16 = 0x08; // kernel code
pub const GD_KD: u16 = 0x10; // kernel data
pub const GD_UT: u16 = 0x18; // user code
pub const GD_UD: u16 = 0x20; // user data
pub const GD_TSS0: u16 = 0x28; // first per-CPU task-state selector

// Access-byte bits
const SEG_A_PRESENT: u8 = 1 << 7;
const SEG_A_RING_3: u8 = 3 << 5;
const SEG_A_CODEDATA: u8 = 1 << 4; // clear for system descriptors
const SEG_A_EXECUTABLE: u8 = 1 << 3;
const SEG_A_RW: u8 = 1 << 1; // readable code / writable data
const SEG_A_TSS32_AVAIL: u8 = 0x9;

// Flags-nibble bits
const SEG_F_PAGE_GRANULARITY: u8 = 1 << 7;
const SEG_F_PROTECTED_32: u8 = 1 << 6;

/// One GDT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SegDesc {
    limitl: u16,
    basel: u16,
    basem: u8,
    access: u8,
    flags_limith: u8,
    baseh: u8,
}

impl SegDesc {
    pub const fn null() -> Self {
        Self {
            limitl: 0,
            basel: 0,
            basem: 0,
            access: 0,
            flags_limith: 0,
            baseh: 0,
        }
    }

    const fn new(base: u32, limit: u32, access: u8, flags: u8) -> Self {
        Self {
            limitl: (limit & 0xffff) as u16,
            basel: (base & 0xffff) as u16,
            basem: ((base >> 16) & 0xff) as u8,
            access,
            flags_limith: (flags & 0xf0) | (((limit >> 16) & 0x0f) as u8),
            baseh: ((base >> 24) & 0xff) as u8,
        }
    }

    /// Flat 4-GiB code or data segment at the given ring.
    const fn flat(ring: u8, executable: bool) -> Self {
        let mut access = SEG_A_PRESENT | SEG_A_CODEDATA | SEG_A_RW | (ring << 5);
        if executable {
            access |= SEG_A_EXECUTABLE;
        }
        Self::new(
            0,
            0xfffff,
            access,
            SEG_F_PAGE_GRANULARITY | SEG_F_PROTECTED_32,
        )
    }

    /// 32-bit available TSS descriptor. Byte-granular; DPL 3 lets the
    /// processor find it from user mode on a trap, while the busy bit
    /// keeps it from being invoked twice.
    pub fn tss(base: u32, limit: u32) -> Self {
        Self::new(base, limit, SEG_A_PRESENT | SEG_A_RING_3 | SEG_A_TSS32_AVAIL, 0)
    }

    pub const fn access(&self) -> u8 {
        self.access
    }

    pub const fn raw(&self) -> u64 {
        (self.limitl as u64)
            | (self.basel as u64) << 16
            | (self.basem as u64) << 32
            | (self.access as u64) << 40
            | (self.flags_limith as u64) << 48
            | (self.baseh as u64) << 56
    }
}

/// 32-bit task-state segment. Only `esp0`/`ss0` (the kernel stack for
/// ring transitions) and `iomb` are ever used; hardware task switching
/// stays off.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TaskState {
    pub link: u32,
    pub esp0: u32,
    pub ss0: u16,
    pub padding1: u16,
    pub esp1: u32,
    pub ss1: u16,
    pub padding2: u16,
    pub esp2: u32,
    pub ss2: u16,
    pub padding3: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    pub padding4: u16,
    pub cs: u16,
    pub padding5: u16,
    pub ss: u16,
    pub padding6: u16,
    pub ds: u16,
    pub padding7: u16,
    pub fs: u16,
    pub padding8: u16,
    pub gs: u16,
    pub padding9: u16,
    pub ldt: u16,
    pub padding10: u16,
    pub trap: u16,
    /// I/O map base; set past the segment limit to deny all user port
    /// access
    pub iomb: u16,
}

impl TaskState {
    pub const fn new() -> Self {
        Self {
            link: 0,
            esp0: 0,
            ss0: 0,
            padding1: 0,
            esp1: 0,
            ss1: 0,
            padding2: 0,
            esp2: 0,
            ss2: 0,
            padding3: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            padding4: 0,
            cs: 0,
            padding5: 0,
            ss: 0,
            padding6: 0,
            ds: 0,
            padding7: 0,
            fs: 0,
            padding8: 0,
            gs: 0,
            padding9: 0,
            ldt: 0,
            padding10: 0,
            trap: 0,
            iomb: 0,
        }
    }

    /// Bind the ring-0 entry stack.
    pub fn set_kernel_stack(&mut self, esp0: VirtAddr, ss0: u16) {
        self.esp0 = esp0.as_u32();
        self.ss0 = ss0;
        self.iomb = core::mem::size_of::<TaskState>() as u16;
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

/// The GDT proper: null, the four flat segments, then one TSS slot per
/// CPU, each written by its owner at bring-up.
#[cfg(all(target_arch = "x86", target_os = "none"))]
static mut GDT: [SegDesc; 5 + NCPU] = {
    let mut gdt = [SegDesc::null(); 5 + NCPU];
    gdt[1] = SegDesc::flat(0, true); // GD_KT
    gdt[2] = SegDesc::flat(0, false); // GD_KD
    gdt[3] = SegDesc::flat(3, true); // GD_UT
    gdt[4] = SegDesc::flat(3, false); // GD_UD
    gdt
};

/// Selector for CPU `i`'s task-state slot.
pub fn tss_selector(cpu: usize) -> u16 {
    assert!(cpu < NCPU);
    GD_TSS0 + ((cpu as u16) << 3)
}

/// Install `ts` in this CPU's task-state slot and load the task
/// register. Called once per CPU during its bring-up.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn load_tss(cpu: usize, ts: &'static TaskState) {
    use x86::{segmentation::SegmentSelector, task, Ring};

    let desc = SegDesc::tss(
        ts as *const TaskState as u32,
        core::mem::size_of::<TaskState>() as u32 - 1,
    );
    // SAFETY: each CPU writes only its own slot, once; no other CPU
    // reads the slot before the owner's `ltr` below.
    unsafe {
        GDT[5 + cpu] = desc;
        task::load_tr(SegmentSelector::from_raw(tss_selector(cpu)));
    }
}

/// Load the GDT and reset the segment registers to the kernel flat
/// segments.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init_percpu() {
    use x86::dtables::{lgdt, DescriptorTablePointer};

    let ptr = DescriptorTablePointer {
        limit: (core::mem::size_of::<[SegDesc; 5 + NCPU]>() - 1) as u16,
        base: &raw const GDT as *const SegDesc,
    };
    // SAFETY: GDT is static and its flat descriptors are fully formed;
    // the segment reloads below use selectors into that table.
    unsafe {
        lgdt(&ptr);
        core::arch::asm!(
            // Data segments first, then CS via far return.
            "mov ds, {kd:x}",
            "mov es, {kd:x}",
            "mov ss, {kd:x}",
            "mov fs, {ud:x}",
            "mov gs, {ud:x}",
            "push {kt}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            kd = in(reg) GD_KD as u32,
            ud = in(reg) (GD_UD | 3) as u32,
            kt = in(reg) GD_KT as u32,
            tmp = out(reg) _,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_layout() {
        // The processor reads esp0/ss0 at these offsets on a ring
        // transition.
        assert_eq!(core::mem::size_of::<TaskState>(), 104);
        assert_eq!(core::mem::offset_of!(TaskState, esp0), 4);
        assert_eq!(core::mem::offset_of!(TaskState, ss0), 8);
        assert_eq!(core::mem::offset_of!(TaskState, iomb), 102);
    }

    #[test]
    fn flat_segment_encoding() {
        // Flat 4-GiB kernel code segment: base 0, limit 0xfffff pages,
        // present, ring 0, executable, readable.
        let kt = SegDesc::flat(0, true);
        assert_eq!(kt.raw(), 0x00cf_9a00_0000_ffff);
        let kd = SegDesc::flat(0, false);
        assert_eq!(kd.raw(), 0x00cf_9200_0000_ffff);
        let ut = SegDesc::flat(3, true);
        assert_eq!(ut.raw(), 0x00cf_fa00_0000_ffff);
        let ud = SegDesc::flat(3, false);
        assert_eq!(ud.raw(), 0x00cf_f200_0000_ffff);
    }

    #[test]
    fn tss_descriptor_encoding() {
        let desc = SegDesc::tss(0x1234_5678, 103);
        // Present, DPL 3, type 0x9 (32-bit available TSS), byte
        // granularity.
        assert_eq!(desc.access(), 0xe9);
        assert_eq!(desc.raw() & 0xffff, 103);
        // Base is split across three fields.
        assert_eq!((desc.raw() >> 16) & 0xffff, 0x5678);
        assert_eq!((desc.raw() >> 32) & 0xff, 0x34);
        assert_eq!((desc.raw() >> 56) & 0xff, 0x12);
    }

    #[test]
    fn tss_selectors_do_not_collide() {
        let mut seen = alloc::vec::Vec::new();
        for cpu in 0..NCPU {
            let sel = tss_selector(cpu);
            assert!(sel >= GD_TSS0);
            assert!(!seen.contains(&sel));
            seen.push(sel);
        }
    }
}
