//! Memory management
//!
//! Address types, the user/kernel memory layout contract, page-table
//! entry flags, the reference-counted frame allocator, and per-environment
//! address spaces.

pub mod aspace;
pub mod frame;

pub use aspace::AddressSpace;
pub use frame::{PageAllocator, PhysPageNum};

/// Size of a page (and a physical frame)
pub const PGSIZE: usize = 4096;
/// log2(PGSIZE)
pub const PGSHIFT: usize = 12;

/// Page-table entries per table / directory entries per directory
pub const NPTENTRIES: usize = 1024;
pub const NPDENTRIES: usize = 1024;

/// Bytes mapped by a single page-directory entry (4 MiB)
pub const PTSIZE: usize = NPTENTRIES * PGSIZE;

// Virtual memory map, top down: kernel direct map at KERNBASE, the
// per-CPU kernel stacks just below it, the MMIO window, a reserved
// band, then user space up to UTOP.

/// All physical memory is mapped at this address
pub const KERNBASE: u32 = 0xf000_0000;

/// Per-CPU kernel stacks descend from here
pub const KSTACKTOP: u32 = KERNBASE;
/// Size of a kernel stack
pub const KSTKSIZE: usize = 8 * PGSIZE;
/// Size of the unmapped gap between kernel stacks
pub const KSTKGAP: usize = 8 * PGSIZE;

/// Memory-mapped I/O window
pub const MMIOLIM: u32 = KSTACKTOP - PTSIZE as u32;
pub const MMIOBASE: u32 = MMIOLIM - PTSIZE as u32;

/// Highest address user environments can observe; the window
/// `[UTOP, ULIM)` is reserved for read-only kernel mirrors.
pub const ULIM: u32 = MMIOBASE;

/// Highest address a user environment may map or pass to a system call
pub const UTOP: u32 = ULIM - 3 * PTSIZE as u32;

/// Top of the one-page user exception stack
pub const UXSTACKTOP: u32 = UTOP;

/// Top of the normal user stack; the page between the two stacks stays
/// unmapped as a guard
pub const USTACKTOP: u32 = UTOP - 2 * PGSIZE as u32;

/// Global frame-allocator instance (bare metal only; tests build their
/// own allocators).
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod global {
    use spin::{Mutex, MutexGuard, Once};

    use super::frame::PageAllocator;
    use super::KERNBASE;

    static PAGE_ALLOC: Once<Mutex<PageAllocator>> = Once::new();

    /// Hand the allocator the physical window: `npages` total, with
    /// everything below `first_free` (null page, I/O hole, kernel
    /// image, boot tables) permanently reserved.
    pub fn init(npages: usize, first_free: usize) {
        PAGE_ALLOC.call_once(|| {
            // SAFETY: the direct map at KERNBASE covers the whole
            // managed window, and init runs once, before any consumer.
            let alloc =
                unsafe { PageAllocator::with_reserved(KERNBASE as *mut u8, npages, first_free) };
            log::info!(
                "physical memory: {} pages, {} free",
                alloc.npages(),
                alloc.free_count()
            );
            Mutex::new(alloc)
        });
    }

    pub fn page_allocator() -> MutexGuard<'static, PageAllocator> {
        PAGE_ALLOC
            .get()
            .expect("page allocator used before init")
            .lock()
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use global::{init as init_page_allocator, page_allocator};

/// A virtual address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Page-directory index of this address
    pub const fn pdx(&self) -> usize {
        (self.0 as usize >> 22) & 0x3ff
    }

    /// Page-table index of this address
    pub const fn ptx(&self) -> usize {
        (self.0 as usize >> PGSHIFT) & 0x3ff
    }

    /// Offset within the page
    pub const fn page_offset(&self) -> usize {
        self.0 as usize & (PGSIZE - 1)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 as usize % PGSIZE == 0
    }

    pub const fn page_round_down(&self) -> Self {
        Self(self.0 & !(PGSIZE as u32 - 1))
    }

    pub const fn page_round_up(&self) -> Self {
        Self((self.0 + PGSIZE as u32 - 1) & !(PGSIZE as u32 - 1))
    }
}

impl core::fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A physical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    pub const fn ppn(&self) -> PhysPageNum {
        PhysPageNum::new(self.0 as usize >> PGSHIFT)
    }
}

bitflags::bitflags! {
    /// Hardware page-table entry bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Present
        const P = 0x001;
        /// Writable
        const W = 0x002;
        /// User-accessible
        const U = 0x004;
        /// Write-through
        const PWT = 0x008;
        /// Cache-disable
        const PCD = 0x010;
        /// Accessed (set by hardware)
        const A = 0x020;
        /// Dirty (set by hardware)
        const D = 0x040;
        /// Page size (directory entries only)
        const PS = 0x080;
        /// Software-available bit, reserved for OS use
        const AVAIL = 0x200;
    }
}

impl PteFlags {
    /// Bits a user environment may set on a mapping through the
    /// system-call surface.
    pub const SYSCALL_MASK: PteFlags = PteFlags::P
        .union(PteFlags::W)
        .union(PteFlags::U)
        .union(PteFlags::PWT)
        .union(PteFlags::PCD)
        .union(PteFlags::AVAIL);

    /// Check a user-supplied permission word: user and present must be
    /// set, and nothing outside the syscall mask.
    pub fn user_perm_ok(perm: u32) -> bool {
        let required = (PteFlags::U | PteFlags::P).bits();
        perm & required == required && perm & !Self::SYSCALL_MASK.bits() == 0
    }
}

/// A page-table (or page-directory) entry: physical frame address in the
/// upper bits, `PteFlags` in the lower 12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub u32);

impl Pte {
    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn new(ppn: PhysPageNum, flags: PteFlags) -> Self {
        Self(((ppn.as_usize() as u32) << PGSHIFT) | flags.bits())
    }

    pub fn is_present(&self) -> bool {
        self.0 & PteFlags::P.bits() != 0
    }

    pub fn ppn(&self) -> PhysPageNum {
        PhysPageNum::new(self.0 as usize >> PGSHIFT)
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_regions_nest() {
        assert_eq!(UXSTACKTOP, UTOP);
        assert!(USTACKTOP < UXSTACKTOP - PGSIZE as u32);
        assert!(UTOP < ULIM);
        assert!(ULIM < KERNBASE);
        assert_eq!(UTOP as usize % PTSIZE, 0);
    }

    #[test]
    fn va_indexing() {
        let va = VirtAddr::new(0xeebf_e123);
        assert_eq!(va.pdx(), 0xeebf_e123usize >> 22);
        assert_eq!(va.ptx(), (0xeebf_e123usize >> 12) & 0x3ff);
        assert_eq!(va.page_offset(), 0x123);
        assert_eq!(va.page_round_down().as_u32(), 0xeebf_e000);
        assert_eq!(va.page_round_up().as_u32(), 0xeebf_f000);
    }

    #[test]
    fn user_perm_mask() {
        let up = (PteFlags::U | PteFlags::P).bits();
        assert!(PteFlags::user_perm_ok(up));
        assert!(PteFlags::user_perm_ok(up | PteFlags::W.bits()));
        assert!(PteFlags::user_perm_ok(up | PteFlags::AVAIL.bits()));
        assert!(PteFlags::user_perm_ok(
            up | PteFlags::PWT.bits() | PteFlags::PCD.bits()
        ));
        // user or present missing
        assert!(!PteFlags::user_perm_ok(PteFlags::P.bits()));
        assert!(!PteFlags::user_perm_ok(PteFlags::U.bits()));
        // hardware-owned or unknown bits
        assert!(!PteFlags::user_perm_ok(up | PteFlags::A.bits()));
        assert!(!PteFlags::user_perm_ok(up | PteFlags::PS.bits()));
        assert!(!PteFlags::user_perm_ok(up | 0x800));
    }

    #[test]
    fn pte_round_trip() {
        let pte = Pte::new(PhysPageNum::new(0x1234), PteFlags::P | PteFlags::W);
        assert!(pte.is_present());
        assert_eq!(pte.ppn().as_usize(), 0x1234);
        assert_eq!(pte.flags(), PteFlags::P | PteFlags::W);
        assert!(!Pte::zero().is_present());
    }
}
