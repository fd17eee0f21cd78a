//! Kernel image entry point
//!
//! A multiboot-loaded 32-bit kernel linked high at `KERNBASE`. The
//! assembly prologue runs at the load address with paging off: it
//! installs a throwaway page directory mapping the kernel both at its
//! physical home and at `KERNBASE`, turns paging on, and jumps to the
//! high half, where `kernel_main` brings the machine up properly.
//!
//! Building the binary on a host target produces an inert stub so the
//! workspace builds and tests everywhere.

#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_std)]
#![cfg_attr(all(target_arch = "x86", target_os = "none"), no_main)]

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod kernel {
    use cinnabar_kernel::mm::{KERNBASE, PGSIZE};
    use cinnabar_kernel::println;
    use cinnabar_kernel::{arch, cpu, env, logger, mm, monitor, sched, sync, trap};
    use core::panic::PanicInfo;

    // Multiboot header, the throwaway entry page directory (two 4-MiB
    // page-size-extension entries: identity and KERNBASE), and the
    // prologue itself. The prologue runs at physical addresses, so
    // symbol references are relocated down by hand before paging is on.
    core::arch::global_asm!(
        r#"
        .set KERNBASE_ASM, 0xf0000000
        .set MULTIBOOT_MAGIC, 0x1badb002

        .section .multiboot
        .align 4
        .long MULTIBOOT_MAGIC
        .long 0
        .long -MULTIBOOT_MAGIC

        .section .data
        .align 4096
        entry_pgdir:
        .long 0x00000083            /* [0, 4M) -> [0, 4M) P|W|PS */
        .fill 0x3bf, 4, 0
        .long 0x00000083            /* [KERNBASE, +4M) -> [0, 4M) */
        .fill 0x3f, 4, 0

        .section .text
        /* The loader enters at the physical alias of `entry`; paging
           is off, so the linked (high) address is not yet valid. */
        .globl _start
        _start = entry - KERNBASE_ASM

        .globl entry
        entry:
          movl $entry_pgdir, %eax
          subl $KERNBASE_ASM, %eax
          movl %eax, %cr3
          movl %cr4, %eax
          orl $0x10, %eax           /* PSE: 4-MiB pages */
          movl %eax, %cr4
          movl %cr0, %eax
          orl $0x80010001, %eax     /* PG | WP | PE */
          movl %eax, %cr0
          movl $1f, %eax            /* absolute jump into the high half */
          jmp *%eax
        1:
          movl $boot_stack_top, %esp
          xorl %ebp, %ebp
          call kernel_main
        2:
          hlt
          jmp 2b

        .section .bss
        .align 16
        boot_stack:
        .space 0x8000
        boot_stack_top:
        "#,
        options(att_syntax)
    );

    /// Kernel heap backing store; handed to the global allocator
    /// before anything allocates.
    const HEAP_SIZE: usize = 2 * 1024 * 1024;
    #[repr(align(4096))]
    struct HeapArea([u8; HEAP_SIZE]);
    static mut HEAP: HeapArea = HeapArea([0; HEAP_SIZE]);

    extern "C" {
        /// End of the kernel image (linker script symbol).
        static end: u8;
    }

    #[no_mangle]
    extern "C" fn kernel_main() -> ! {
        // SAFETY: single-threaded boot; the heap arena is unused until
        // this handoff.
        unsafe {
            let heap = &raw mut HEAP;
            cinnabar_kernel::allocator()
                .lock()
                .init(heap as *mut u8, HEAP_SIZE);
        }

        arch::init();
        logger::init();
        println!("cinnabar kernel v{}", env!("CARGO_PKG_VERSION"));

        // Physical memory: everything below the end of the image (plus
        // the boot heap, which sits inside the image's bss) stays
        // reserved.
        let npages = arch::x86::detect_npages();
        // SAFETY: `end` is a linker symbol; only its address is used.
        let image_end = unsafe { &raw const end } as u32;
        let first_free = (arch::x86::va_to_pa(image_end).as_u32() as usize).div_ceil(PGSIZE);
        mm::init_page_allocator(npages, first_free);

        trap::init();
        arch::x86::lapic::init();

        log::info!(
            "cpu {} up, kernel mapped at {:#x}",
            cpu::cpu_index(),
            KERNBASE
        );

        // Create the first environment from the embedded init image,
        // then hand the CPU to the scheduler.
        {
            let image = env::embedded::init_image();
            let mut table = env::env_table();
            let mut alloc = mm::page_allocator();
            let id = env::load::create(&mut table, &mut alloc, &image)
                .expect("failed to create the init environment");
            log::info!("init environment {:08x} created", id.as_u32());
        }

        sync::KERNEL_LOCK.lock();
        sched::sched_yield();
    }

    /// Entry for secondary CPUs, called out of the AP bootstrap
    /// trampoline once it has switched to protected mode and paging.
    #[no_mangle]
    extern "C" fn ap_main() -> ! {
        arch::x86::lapic::init();
        arch::x86::gdt::init_percpu();
        trap::init_percpu();

        cpu::this_cpu().set_status(cpu::CpuStatus::Started);
        sync::KERNEL_LOCK.lock();
        sched::sched_yield();
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("kernel panic on CPU {}: {}", cpu::cpu_index(), info);
        monitor::enter();
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn main() {
    eprintln!("cinnabar-kernel is a bare-metal image; build for the kernel target to run it");
}
