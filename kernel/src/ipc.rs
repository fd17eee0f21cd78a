//! Inter-environment messaging
//!
//! A rendezvous protocol: the receiver parks itself with `recv`, and a
//! sender completes the exchange with `try_send`, writing the result
//! directly into the receiver's saved state. Sends never block: a
//! sender that arrives while the receiver is not parked gets
//! `IPC_NOT_RECV` and is expected to retry. Any environment may send to
//! any other; the parent-capability rule deliberately does not apply
//! here.

use crate::env::{EnvId, EnvStatus, EnvTable};
use crate::error::{KernelError, Result};
use crate::mm::{PageAllocator, PteFlags, VirtAddr, UTOP};

/// Attempt to deliver `value` (and, when both sides opted in, the page
/// mapped at `srcva`) to `dst_id`.
///
/// A page travels only if the sender passes `srcva < UTOP` *and* the
/// receiver advertised a destination below `UTOP`; otherwise the value
/// alone is delivered and the recorded permissions are zero. On
/// success the receiver is made runnable with a zero result register.
///
/// First send wins: delivery clears the receive flag under the table
/// lock, so a second sender racing for the same receiver sees
/// `IPC_NOT_RECV`.
pub fn try_send(
    table: &mut EnvTable,
    alloc: &mut PageAllocator,
    cur: EnvId,
    dst_id: EnvId,
    value: u32,
    srcva: VirtAddr,
    perm: u32,
) -> Result<()> {
    // No capability check: sends cross the parent/child boundary.
    let dst_id = table.resolve(dst_id, cur, false)?;
    let dst = table.env(dst_id)?;
    if !dst.ipc_recving {
        return Err(KernelError::IpcNotRecv);
    }
    let recv_va = dst.ipc_dstva;

    let mut delivered_perm = 0u32;
    if srcva.as_u32() < UTOP {
        if !srcva.is_page_aligned() {
            return Err(KernelError::Inval);
        }
        if !PteFlags::user_perm_ok(perm) {
            return Err(KernelError::Inval);
        }
        let src = table.env(cur)?;
        let (ppn, flags) = src
            .aspace
            .lookup(alloc, srcva)
            .ok_or(KernelError::Inval)?;
        let perm_flags = PteFlags::from_bits_truncate(perm);
        if perm_flags.contains(PteFlags::W) && !flags.contains(PteFlags::W) {
            return Err(KernelError::Inval);
        }

        if recv_va.as_u32() < UTOP {
            table
                .env_mut(dst_id)?
                .aspace
                .insert(alloc, ppn, recv_va, perm_flags)
                .map_err(|_| KernelError::NoMem)?;
            delivered_perm = perm;
        }
    }

    let dst = table.env_mut(dst_id)?;
    dst.ipc_recving = false;
    dst.ipc_from = cur;
    dst.ipc_value = value;
    dst.ipc_perm = delivered_perm;
    dst.status = EnvStatus::Runnable;
    dst.tf_mut().regs.eax = 0;
    Ok(())
}

/// Park the caller waiting for a message. `dstva` below `UTOP`
/// advertises where an incoming page should land and must be
/// page-aligned. The caller's result register is seeded with zero; the
/// eventual sender writes everything else. Returns `Ok` when the
/// caller should yield without returning.
pub fn recv(table: &mut EnvTable, cur: EnvId, dstva: VirtAddr) -> Result<()> {
    if dstva.as_u32() < UTOP && !dstva.is_page_aligned() {
        return Err(KernelError::Inval);
    }
    let env = table.env_mut(cur)?;
    env.ipc_recving = true;
    env.ipc_dstva = dstva;
    env.status = EnvStatus::NotRunnable;
    env.tf_mut().regs.eax = 0;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPW: PteFlags = PteFlags::U.union(PteFlags::P).union(PteFlags::W);
    const NO_PAGE: VirtAddr = VirtAddr::new(UTOP);

    fn setup() -> (PageAllocator, EnvTable, EnvId, EnvId) {
        let mut alloc = PageAllocator::in_memory(128);
        let mut table = EnvTable::new();
        let a = table.alloc(&mut alloc, EnvId::KERNEL).unwrap();
        let b = table.alloc(&mut alloc, EnvId::KERNEL).unwrap();
        (alloc, table, a, b)
    }

    #[test]
    fn send_to_non_receiver_fails() {
        let (mut alloc, mut table, a, b) = setup();
        assert_eq!(
            try_send(&mut table, &mut alloc, b, a, 1, NO_PAGE, 0),
            Err(KernelError::IpcNotRecv)
        );
    }

    #[test]
    fn value_only_round_trip() {
        let (mut alloc, mut table, a, b) = setup();
        recv(&mut table, a, NO_PAGE).unwrap();
        assert_eq!(table.env(a).unwrap().status(), EnvStatus::NotRunnable);

        try_send(&mut table, &mut alloc, b, a, 42, NO_PAGE, 0).unwrap();
        let receiver = table.env(a).unwrap();
        assert_eq!(receiver.status(), EnvStatus::Runnable);
        assert_eq!(receiver.ipc_value, 42);
        assert_eq!(receiver.ipc_from, b);
        assert_eq!(receiver.ipc_perm, 0);
        assert_eq!(receiver.tf().regs.eax, 0);
    }

    #[test]
    fn page_transfer_maps_shared_frame() {
        let (mut alloc, mut table, a, b) = setup();
        let frame = alloc.alloc(true).unwrap();
        table
            .env_mut(b)
            .unwrap()
            .aspace
            .insert(&mut alloc, frame, VirtAddr::new(0x2000), UPW)
            .unwrap();

        recv(&mut table, a, VirtAddr::new(0x1000)).unwrap();
        try_send(
            &mut table,
            &mut alloc,
            b,
            a,
            42,
            VirtAddr::new(0x2000),
            UPW.bits(),
        )
        .unwrap();

        let receiver = table.env(a).unwrap();
        assert_eq!(receiver.ipc_value, 42);
        assert_eq!(receiver.ipc_perm, UPW.bits());
        assert_eq!(receiver.ipc_from, b);
        // Same physical frame now mapped on both sides.
        let (mapped, _) = receiver
            .aspace
            .lookup(&mut alloc, VirtAddr::new(0x1000))
            .unwrap();
        assert_eq!(mapped, frame);
        assert_eq!(alloc.refcount(frame), 2);
    }

    #[test]
    fn sender_page_above_utop_transfers_nothing() {
        let (mut alloc, mut table, a, b) = setup();
        recv(&mut table, a, VirtAddr::new(0x1000)).unwrap();
        try_send(&mut table, &mut alloc, b, a, 7, NO_PAGE, UPW.bits()).unwrap();
        let receiver = table.env(a).unwrap();
        assert_eq!(receiver.ipc_perm, 0);
        assert!(receiver
            .aspace
            .lookup(&mut alloc, VirtAddr::new(0x1000))
            .is_none());
    }

    #[test]
    fn receiver_opting_out_still_gets_value() {
        let (mut alloc, mut table, a, b) = setup();
        let frame = alloc.alloc(true).unwrap();
        table
            .env_mut(b)
            .unwrap()
            .aspace
            .insert(&mut alloc, frame, VirtAddr::new(0x2000), UPW)
            .unwrap();

        recv(&mut table, a, NO_PAGE).unwrap();
        try_send(&mut table, &mut alloc, b, a, 9, VirtAddr::new(0x2000), UPW.bits()).unwrap();
        let receiver = table.env(a).unwrap();
        assert_eq!(receiver.ipc_value, 9);
        assert_eq!(receiver.ipc_perm, 0);
        assert_eq!(alloc.refcount(frame), 1);
    }

    #[test]
    fn first_send_wins() {
        let (mut alloc, mut table, a, b1) = setup();
        let b2 = table.alloc(&mut alloc, EnvId::KERNEL).unwrap();
        recv(&mut table, a, NO_PAGE).unwrap();

        try_send(&mut table, &mut alloc, b1, a, 100, NO_PAGE, 0).unwrap();
        // The receiver has not run again; a second sender must lose.
        assert_eq!(
            try_send(&mut table, &mut alloc, b2, a, 200, NO_PAGE, 0),
            Err(KernelError::IpcNotRecv)
        );
        assert_eq!(table.env(a).unwrap().ipc_value, 100);
        assert_eq!(table.env(a).unwrap().ipc_from, b1);
    }

    #[test]
    fn write_perm_from_readonly_source_fails() {
        let (mut alloc, mut table, a, b) = setup();
        let frame = alloc.alloc(true).unwrap();
        table
            .env_mut(b)
            .unwrap()
            .aspace
            .insert(&mut alloc, frame, VirtAddr::new(0x2000), PteFlags::U | PteFlags::P)
            .unwrap();

        recv(&mut table, a, VirtAddr::new(0x1000)).unwrap();
        assert_eq!(
            try_send(&mut table, &mut alloc, b, a, 1, VirtAddr::new(0x2000), UPW.bits()),
            Err(KernelError::Inval)
        );
        // The failed send left the receiver parked.
        assert!(table.env(a).unwrap().ipc_recving);
    }

    #[test]
    fn unaligned_or_unmapped_source_fails() {
        let (mut alloc, mut table, a, b) = setup();
        recv(&mut table, a, VirtAddr::new(0x1000)).unwrap();
        assert_eq!(
            try_send(&mut table, &mut alloc, b, a, 1, VirtAddr::new(0x2004), UPW.bits()),
            Err(KernelError::Inval)
        );
        assert_eq!(
            try_send(&mut table, &mut alloc, b, a, 1, VirtAddr::new(0x2000), UPW.bits()),
            Err(KernelError::Inval)
        );
    }

    #[test]
    fn recv_rejects_unaligned_dstva() {
        let (_alloc, mut table, a, _b) = setup();
        assert_eq!(
            recv(&mut table, a, VirtAddr::new(0x1001)),
            Err(KernelError::Inval)
        );
        // Above UTOP, alignment is irrelevant.
        assert!(recv(&mut table, a, VirtAddr::new(UTOP + 1)).is_ok());
    }
}
