//! User page-fault reflection
//!
//! A page fault taken in user mode is bounced back to the faulting
//! environment: the kernel builds a `UTrapframe` on the environment's
//! exception-stack page and restarts it at its registered upcall entry.
//! A fault taken while already running on the exception stack nests:
//! the new frame lands below the old one with one scratch word between
//! them, which the user-mode return trampoline needs to restore `eip`
//! atomically.

use super::frame::UTrapframe;
use crate::env::{EnvId, EnvTable};
use crate::mm::{PageAllocator, PteFlags, VirtAddr, PGSIZE, UXSTACKTOP};

/// Where the next `UTrapframe` lands, given the trap-time stack
/// pointer. Returns the lowest address of the frame.
pub fn landing_va(esp: u32) -> VirtAddr {
    let size = core::mem::size_of::<UTrapframe>() as u32;
    let on_exception_stack =
        (UXSTACKTOP - PGSIZE as u32..UXSTACKTOP).contains(&esp);
    if on_exception_stack {
        // Recursive fault: push below the live frame, skipping the
        // scratch word.
        VirtAddr::new(esp - 4 - size)
    } else {
        VirtAddr::new(UXSTACKTOP - size)
    }
}

/// Reflect a user page fault at `fault_va` into `cur`'s upcall.
/// Returns true when the environment was redirected and should be
/// resumed; false when it had to be destroyed (no upcall registered,
/// or its exception stack is missing, read-only, or exhausted).
pub fn reflect(
    table: &mut EnvTable,
    alloc: &mut PageAllocator,
    cur: EnvId,
    fault_va: VirtAddr,
) -> bool {
    let Ok(env) = table.env_mut(cur) else {
        return false;
    };

    let destroy = |table: &mut EnvTable, alloc: &mut PageAllocator, eip: u32| {
        println!(
            "[{:08x}] user fault va {:08x} ip {:08x}",
            cur, fault_va, eip
        );
        table.destroy(alloc, cur, cur);
        false
    };

    let eip = env.tf().eip;
    let Some(upcall) = env.pgfault_upcall else {
        return destroy(table, alloc, eip);
    };

    let utf = UTrapframe::from_trapframe(env.tf(), fault_va);
    let landing = landing_va(env.tf().esp);

    // The landing range must be user-writable in the faulting
    // environment; the guard page below the exception stack turns
    // stack exhaustion into a failure here.
    let env = table.env(cur).expect("reflect: environment vanished");
    if env
        .aspace
        .user_mem_check(
            alloc,
            landing,
            core::mem::size_of::<UTrapframe>(),
            PteFlags::W,
        )
        .is_err()
    {
        return destroy(table, alloc, eip);
    }

    env.aspace.copy_to_user(alloc, landing, utf.as_bytes());
    let env = table.env_mut(cur).expect("reflect: environment vanished");
    env.tf_mut().eip = upcall.as_u32();
    env.tf_mut().esp = landing.as_u32();
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvStatus;
    use crate::trap::frame::UTrapframe;

    const UPW: PteFlags = PteFlags::U.union(PteFlags::P).union(PteFlags::W);
    const UTF_SIZE: u32 = core::mem::size_of::<UTrapframe>() as u32;

    struct Fixture {
        alloc: PageAllocator,
        table: EnvTable,
        env: EnvId,
    }

    fn setup(upcall: Option<u32>, map_xstack: bool) -> Fixture {
        let mut alloc = PageAllocator::in_memory(64);
        let mut table = EnvTable::new();
        let env = table.alloc(&mut alloc, EnvId::KERNEL).unwrap();
        if let Some(va) = upcall {
            table.env_mut(env).unwrap().pgfault_upcall = Some(VirtAddr::new(va));
        }
        if map_xstack {
            let frame = alloc.alloc(true).unwrap();
            table
                .env_mut(env)
                .unwrap()
                .aspace
                .insert(
                    &mut alloc,
                    frame,
                    VirtAddr::new(UXSTACKTOP - PGSIZE as u32),
                    UPW,
                )
                .unwrap();
        }
        Fixture { alloc, table, env }
    }

    #[test]
    fn first_fault_lands_at_stack_top() {
        assert_eq!(landing_va(0xeebf_d000).as_u32(), UXSTACKTOP - UTF_SIZE);
    }

    #[test]
    fn nested_fault_leaves_one_scratch_word() {
        let esp = UXSTACKTOP - 0x40;
        assert_eq!(landing_va(esp).as_u32(), esp - 4 - UTF_SIZE);
    }

    #[test]
    fn exception_stack_boundaries() {
        // One byte into the exception page counts as recursive.
        let esp = UXSTACKTOP - 1;
        assert_eq!(landing_va(esp).as_u32(), esp - 4 - UTF_SIZE);
        // At UXSTACKTOP exactly (one past the page) it does not.
        assert_eq!(landing_va(UXSTACKTOP).as_u32(), UXSTACKTOP - UTF_SIZE);
        // Just below the page start it does not either.
        assert_eq!(
            landing_va(UXSTACKTOP - PGSIZE as u32 - 4).as_u32(),
            UXSTACKTOP - UTF_SIZE
        );
    }

    #[test]
    fn reflect_builds_frame_and_redirects() {
        let mut fx = setup(Some(0x0be0), true);
        {
            let tf = fx.table.env_mut(fx.env).unwrap().tf_mut();
            tf.eip = 0x80_1234;
            tf.esp = 0xeebf_d800;
            tf.err = 0x7;
            tf.regs.ecx = 99;
        }

        assert!(reflect(
            &mut fx.table,
            &mut fx.alloc,
            fx.env,
            VirtAddr::new(0x4022)
        ));

        let env = fx.table.env(fx.env).unwrap();
        let landing = VirtAddr::new(UXSTACKTOP - UTF_SIZE);
        assert_eq!(env.tf().eip, 0x0be0);
        assert_eq!(env.tf().esp, landing.as_u32());

        // The frame on the exception stack captures the fault state.
        let mut buf = [0u8; core::mem::size_of::<UTrapframe>()];
        env.aspace.copy_from_user(&mut fx.alloc, landing, &mut buf);
        let utf: UTrapframe =
            unsafe { core::ptr::read_unaligned(buf.as_ptr().cast()) };
        assert_eq!(utf.fault_va, 0x4022);
        assert_eq!(utf.eip, 0x80_1234);
        assert_eq!(utf.esp, 0xeebf_d800);
        assert_eq!(utf.err, 0x7);
        assert_eq!(utf.regs.ecx, 99);
    }

    #[test]
    fn recursive_fault_stacks_below_previous_frame() {
        let mut fx = setup(Some(0x0be0), true);
        let esp = UXSTACKTOP - 0x40;
        fx.table.env_mut(fx.env).unwrap().tf_mut().esp = esp;

        assert!(reflect(
            &mut fx.table,
            &mut fx.alloc,
            fx.env,
            VirtAddr::new(0x1000)
        ));
        assert_eq!(
            fx.table.env(fx.env).unwrap().tf().esp,
            esp - 4 - UTF_SIZE
        );
    }

    #[test]
    fn no_upcall_destroys_environment() {
        let mut fx = setup(None, true);
        assert!(!reflect(
            &mut fx.table,
            &mut fx.alloc,
            fx.env,
            VirtAddr::new(0x4022)
        ));
        assert!(fx.table.get(fx.env).is_none());
    }

    #[test]
    fn missing_exception_stack_destroys_environment() {
        let mut fx = setup(Some(0x0be0), false);
        assert!(!reflect(
            &mut fx.table,
            &mut fx.alloc,
            fx.env,
            VirtAddr::new(0x4022)
        ));
        assert!(fx.table.get(fx.env).is_none());
    }

    #[test]
    fn exhausted_exception_stack_destroys_environment() {
        let mut fx = setup(Some(0x0be0), true);
        // Parked so deep that the next frame would spill onto the
        // unmapped guard page.
        fx.table.env_mut(fx.env).unwrap().tf_mut().esp =
            UXSTACKTOP - PGSIZE as u32 + 8;
        assert!(!reflect(
            &mut fx.table,
            &mut fx.alloc,
            fx.env,
            VirtAddr::new(0x4022)
        ));
        assert!(fx.table.get(fx.env).is_none());
    }

    #[test]
    fn destroyed_environment_does_not_disturb_others() {
        let mut fx = setup(None, false);
        let bystander = fx.table.alloc(&mut fx.alloc, EnvId::KERNEL).unwrap();
        fx.table.env_mut(bystander).unwrap().status = EnvStatus::Runnable;

        assert!(!reflect(
            &mut fx.table,
            &mut fx.alloc,
            fx.env,
            VirtAddr::new(0x4022)
        ));
        assert_eq!(
            fx.table.env(bystander).unwrap().status(),
            EnvStatus::Runnable
        );
    }
}
