//! Per-environment address spaces
//!
//! A two-level x86 page directory stored in allocator frames. All
//! operations take the frame allocator explicitly; nothing here touches
//! global state, which keeps the walk/insert/remove machinery runnable
//! (and tested) on the host target.
//!
//! Frame ownership: a present leaf PTE counts one reference on its frame;
//! page-table frames and the directory frame itself are pinned with one
//! reference for as long as the address space exists.

use super::frame::{PageAllocator, PhysPageNum};
use super::{Pte, PteFlags, VirtAddr, NPDENTRIES, NPTENTRIES, UTOP};
use crate::error::{KernelError, Result};

/// A per-environment page directory.
#[derive(Debug)]
pub struct AddressSpace {
    pdir: PhysPageNum,
}

impl AddressSpace {
    /// Allocate an empty address space. On bare metal the kernel half of
    /// the boot page directory is shared into the new directory so the
    /// kernel is mapped in every environment.
    pub fn new(alloc: &mut PageAllocator) -> Result<Self> {
        let pdir = alloc.alloc(true).ok_or(KernelError::NoMem)?;
        alloc.incref(pdir);
        let aspace = Self { pdir };

        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let kern = crate::arch::x86::boot_pgdir();
            let dir = aspace.dir_mut(alloc);
            for pdx in VirtAddr::new(super::ULIM).pdx()..NPDENTRIES {
                dir[pdx] = kern[pdx];
            }
        }

        Ok(aspace)
    }

    /// Physical frame of the page directory, for loading into CR3.
    pub fn pdir_ppn(&self) -> PhysPageNum {
        self.pdir
    }

    #[allow(clippy::mut_from_ref)]
    fn dir_mut(&self, alloc: &PageAllocator) -> &mut [Pte; NPDENTRIES] {
        // SAFETY: the directory frame is pinned for the life of `self`
        // and is exactly one page; exclusive access follows from the
        // kernel's single-holder locking discipline.
        unsafe { &mut *(alloc.frame_ptr(self.pdir) as *mut [Pte; NPDENTRIES]) }
    }

    #[allow(clippy::mut_from_ref)]
    fn table_mut(alloc: &PageAllocator, pt: PhysPageNum) -> &'static mut [Pte; NPTENTRIES] {
        // SAFETY: page-table frames are pinned while referenced from a
        // present directory entry.
        unsafe { &mut *(alloc.frame_ptr(pt) as *mut [Pte; NPTENTRIES]) }
    }

    /// Find the PTE slot for `va`, optionally creating the page table
    /// that holds it. Returns `None` if the table is absent and `create`
    /// is false, or if table allocation fails.
    fn walk<'a>(
        &self,
        alloc: &'a mut PageAllocator,
        va: VirtAddr,
        create: bool,
    ) -> Option<&'a mut Pte> {
        let pde = &mut self.dir_mut(alloc)[va.pdx()];
        let pt = if pde.is_present() {
            pde.ppn()
        } else {
            if !create {
                return None;
            }
            let pt = alloc.alloc(true)?;
            alloc.incref(pt);
            // Directory-level permissions are permissive; the leaf PTE
            // is authoritative.
            *self.dir_mut(alloc).get_mut(va.pdx())? =
                Pte::new(pt, PteFlags::P | PteFlags::W | PteFlags::U);
            pt
        };
        Some(&mut Self::table_mut(alloc, pt)[va.ptx()])
    }

    /// Map frame `ppn` at `va` with `perm | P`, replacing any existing
    /// mapping. The frame's refcount is incremented; remapping the same
    /// frame at the same address is safe and does not free it.
    pub fn insert(
        &mut self,
        alloc: &mut PageAllocator,
        ppn: PhysPageNum,
        va: VirtAddr,
        perm: PteFlags,
    ) -> Result<()> {
        if self.walk(alloc, va, true).is_none() {
            return Err(KernelError::NoMem);
        }
        alloc.incref(ppn);
        self.remove(alloc, va);
        let pte = self
            .walk(alloc, va, false)
            .expect("walk: table vanished after create");
        *pte = Pte::new(ppn, perm | PteFlags::P);
        Ok(())
    }

    /// Look up the mapping at `va`: the physical frame and a copy of the
    /// PTE flags, if present.
    pub fn lookup(&self, alloc: &mut PageAllocator, va: VirtAddr) -> Option<(PhysPageNum, PteFlags)> {
        let pte = self.walk(alloc, va, false)?;
        if !pte.is_present() {
            return None;
        }
        Some((pte.ppn(), pte.flags()))
    }

    /// Unmap `va`, dropping the frame reference. Unmapping an unmapped
    /// address silently succeeds.
    pub fn remove(&mut self, alloc: &mut PageAllocator, va: VirtAddr) {
        let Some(pte) = self.walk(alloc, va, false) else {
            return;
        };
        if !pte.is_present() {
            return;
        }
        let ppn = pte.ppn();
        *pte = Pte::zero();
        alloc.decref(ppn);
        tlb_invalidate(va);
    }

    /// Check that `[va, va + len)` can be accessed with permissions
    /// `perm | P | U` and lies below `ULIM`. On failure returns the
    /// lowest faulting address, the way the page-fault reporting path
    /// wants it.
    pub fn user_mem_check(
        &self,
        alloc: &mut PageAllocator,
        va: VirtAddr,
        len: usize,
        perm: PteFlags,
    ) -> core::result::Result<(), VirtAddr> {
        let need = perm | PteFlags::P | PteFlags::U;
        let end = VirtAddr::new(va.as_u32().wrapping_add(len as u32)).page_round_up();
        let mut page = va.page_round_down();
        while page < end {
            let first = if page < va { va } else { page };
            if first.as_u32() >= super::ULIM {
                return Err(first);
            }
            match self.lookup(alloc, page) {
                Some((_, flags)) if flags.contains(need) => {}
                _ => return Err(first),
            }
            page = VirtAddr::new(page.as_u32() + super::PGSIZE as u32);
        }
        Ok(())
    }

    /// Copy `len` bytes out of this address space into a kernel buffer.
    /// The caller must have run `user_mem_check` first.
    pub fn copy_from_user(
        &self,
        alloc: &mut PageAllocator,
        va: VirtAddr,
        buf: &mut [u8],
    ) {
        let mut off = 0usize;
        while off < buf.len() {
            let cur = VirtAddr::new(va.as_u32() + off as u32);
            let (ppn, _) = self
                .lookup(alloc, cur.page_round_down())
                .expect("copy_from_user: unmapped page after check");
            let in_page = super::PGSIZE - cur.page_offset();
            let n = core::cmp::min(in_page, buf.len() - off);
            // SAFETY: source is a mapped frame, destination is a kernel
            // slice; ranges were just computed to stay in bounds.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    alloc.frame_ptr(ppn).add(cur.page_offset()),
                    buf.as_mut_ptr().add(off),
                    n,
                );
            }
            off += n;
        }
    }

    /// Copy a kernel buffer into this address space. The caller must
    /// have verified writability first.
    pub fn copy_to_user(&self, alloc: &mut PageAllocator, va: VirtAddr, buf: &[u8]) {
        let mut off = 0usize;
        while off < buf.len() {
            let cur = VirtAddr::new(va.as_u32() + off as u32);
            let (ppn, _) = self
                .lookup(alloc, cur.page_round_down())
                .expect("copy_to_user: unmapped page after check");
            let in_page = super::PGSIZE - cur.page_offset();
            let n = core::cmp::min(in_page, buf.len() - off);
            // SAFETY: destination is a mapped frame, source is a kernel
            // slice; ranges were just computed to stay in bounds.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    buf.as_ptr().add(off),
                    alloc.frame_ptr(ppn).add(cur.page_offset()),
                    n,
                );
            }
            off += n;
        }
    }

    /// Allocate zeroed frames for `[va, va + len)` (page-rounded) and
    /// map them user-writable. Already-mapped pages are left alone.
    pub fn region_alloc(
        &mut self,
        alloc: &mut PageAllocator,
        va: VirtAddr,
        len: usize,
    ) -> Result<()> {
        let start = va.page_round_down();
        let end = VirtAddr::new(va.as_u32() + len as u32).page_round_up();
        let mut page = start;
        while page < end {
            if self.lookup(alloc, page).is_none() {
                let frame = alloc.alloc(true).ok_or(KernelError::NoMem)?;
                self.insert(alloc, frame, page, PteFlags::U | PteFlags::W)?;
            }
            page = VirtAddr::new(page.as_u32() + super::PGSIZE as u32);
        }
        Ok(())
    }

    /// Tear the address space down: unmap the whole user region, free
    /// the page-table frames, then the directory itself.
    pub fn teardown(mut self, alloc: &mut PageAllocator) {
        let top = VirtAddr::new(UTOP);
        for pdx in 0..top.pdx() {
            let pde = self.dir_mut(alloc)[pdx];
            if !pde.is_present() {
                continue;
            }
            let pt = pde.ppn();
            for ptx in 0..NPTENTRIES {
                let va = VirtAddr::new(((pdx << 22) | (ptx << super::PGSHIFT)) as u32);
                self.remove(alloc, va);
            }
            self.dir_mut(alloc)[pdx] = Pte::zero();
            alloc.decref(pt);
        }
        alloc.decref(self.pdir);
    }
}

fn tlb_invalidate(_va: VirtAddr) {
    // invlpg on the active directory; stale entries for other
    // directories are flushed wholesale by the CR3 reload in env_run.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: flushing a TLB entry has no memory-safety preconditions.
    unsafe {
        x86::tlb::flush(_va.as_u32() as usize)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{PGSIZE, UTOP};

    const UP: PteFlags = PteFlags::U.union(PteFlags::P);

    fn setup() -> (PageAllocator, AddressSpace) {
        let mut alloc = PageAllocator::in_memory(32);
        let aspace = AddressSpace::new(&mut alloc).unwrap();
        (alloc, aspace)
    }

    #[test]
    fn insert_lookup_remove() {
        let (mut alloc, mut aspace) = setup();
        let frame = alloc.alloc(true).unwrap();
        let va = VirtAddr::new(0x80_0000);

        aspace.insert(&mut alloc, frame, va, UP | PteFlags::W).unwrap();
        let (ppn, flags) = aspace.lookup(&mut alloc, va).unwrap();
        assert_eq!(ppn, frame);
        assert!(flags.contains(UP | PteFlags::W));
        assert_eq!(alloc.refcount(frame), 1);

        aspace.remove(&mut alloc, va);
        assert!(aspace.lookup(&mut alloc, va).is_none());
        assert_eq!(alloc.refcount(frame), 0);
    }

    #[test]
    fn alloc_then_unmap_preserves_frame_count() {
        let (mut alloc, mut aspace) = setup();
        let before = alloc.free_count();
        let frame = alloc.alloc(true).unwrap();
        aspace.insert(&mut alloc, frame, VirtAddr::new(0x1000), UP).unwrap();
        aspace.remove(&mut alloc, VirtAddr::new(0x1000));
        // The leaf frame came back; the page table stays cached.
        assert_eq!(alloc.free_count(), before - 1);
        aspace.remove(&mut alloc, VirtAddr::new(0x1000));
        assert_eq!(alloc.free_count(), before - 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let (mut alloc, mut aspace) = setup();
        // Unmapped address, never walked: both removes are no-ops.
        aspace.remove(&mut alloc, VirtAddr::new(0x4000));
        aspace.remove(&mut alloc, VirtAddr::new(0x4000));
        assert!(alloc.check_conservation());
    }

    #[test]
    fn remap_same_frame_same_va_survives() {
        let (mut alloc, mut aspace) = setup();
        let frame = alloc.alloc(true).unwrap();
        let va = VirtAddr::new(0x2000);
        aspace.insert(&mut alloc, frame, va, UP).unwrap();
        aspace.insert(&mut alloc, frame, va, UP | PteFlags::W).unwrap();
        let (ppn, flags) = aspace.lookup(&mut alloc, va).unwrap();
        assert_eq!(ppn, frame);
        assert!(flags.contains(PteFlags::W));
        assert_eq!(alloc.refcount(frame), 1);
    }

    #[test]
    fn shared_mapping_refcounts() {
        let mut alloc = PageAllocator::in_memory(32);
        let mut a = AddressSpace::new(&mut alloc).unwrap();
        let mut b = AddressSpace::new(&mut alloc).unwrap();
        let frame = alloc.alloc(true).unwrap();

        a.insert(&mut alloc, frame, VirtAddr::new(0x1000), UP).unwrap();
        b.insert(&mut alloc, frame, VirtAddr::new(0x7000), UP).unwrap();
        assert_eq!(alloc.refcount(frame), 2);

        b.remove(&mut alloc, VirtAddr::new(0x7000));
        assert_eq!(alloc.refcount(frame), 1);
        // A's view is untouched.
        assert_eq!(a.lookup(&mut alloc, VirtAddr::new(0x1000)).unwrap().0, frame);
    }

    #[test]
    fn user_mem_check_respects_perm_and_ulim() {
        let (mut alloc, mut aspace) = setup();
        let frame = alloc.alloc(true).unwrap();
        let va = VirtAddr::new(0x3000);
        aspace.insert(&mut alloc, frame, va, UP).unwrap();

        assert!(aspace.user_mem_check(&mut alloc, va, PGSIZE, PteFlags::empty()).is_ok());
        // Write access to a read-only mapping fails at the mapped page.
        assert_eq!(
            aspace.user_mem_check(&mut alloc, va, PGSIZE, PteFlags::W),
            Err(va)
        );
        // Crossing into an unmapped page reports the page base.
        assert_eq!(
            aspace.user_mem_check(&mut alloc, VirtAddr::new(0x3800), 0x1000, PteFlags::empty()),
            Err(VirtAddr::new(0x4000))
        );
        // Kernel addresses are never user-accessible.
        assert!(aspace
            .user_mem_check(&mut alloc, VirtAddr::new(super::super::ULIM), 8, PteFlags::empty())
            .is_err());
    }

    #[test]
    fn copy_in_and_out() {
        let (mut alloc, mut aspace) = setup();
        let frame = alloc.alloc(true).unwrap();
        let va = VirtAddr::new(0x5ff8); // straddles a page boundary
        aspace
            .insert(&mut alloc, frame, VirtAddr::new(0x5000), UP | PteFlags::W)
            .unwrap();
        let frame2 = alloc.alloc(true).unwrap();
        aspace
            .insert(&mut alloc, frame2, VirtAddr::new(0x6000), UP | PteFlags::W)
            .unwrap();

        aspace.copy_to_user(&mut alloc, va, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        let mut back = [0u8; 12];
        aspace.copy_from_user(&mut alloc, va, &mut back);
        assert_eq!(back, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    }

    #[test]
    fn teardown_releases_everything() {
        let mut alloc = PageAllocator::in_memory(32);
        let before = alloc.free_count();
        let mut aspace = AddressSpace::new(&mut alloc).unwrap();
        for i in 0..4u32 {
            let frame = alloc.alloc(true).unwrap();
            aspace
                .insert(&mut alloc, frame, VirtAddr::new(0x1000 + i * 0x1000), UP)
                .unwrap();
        }
        // One mapping near the top of user space forces a second table.
        let frame = alloc.alloc(true).unwrap();
        aspace
            .insert(&mut alloc, frame, VirtAddr::new(UTOP - PGSIZE as u32), UP)
            .unwrap();

        aspace.teardown(&mut alloc);
        assert_eq!(alloc.free_count(), before);
        assert!(alloc.check_conservation());
    }
}
