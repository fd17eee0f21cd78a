//! Cinnabar kernel library
//!
//! An exokernel-style kernel for 32-bit protected-mode x86. The library
//! builds for two targets: the bare-metal kernel proper
//! (`target_arch = "x86"`, `target_os = "none"`) and the build host, where
//! the hardware-touching modules are compiled out and the remaining state
//! machines run under the standard `cargo test` harness.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: the system allocator backs `alloc` so tests can use
// Box/Vec normally. Bare metal: the kernel heap (see `heap` module).
#[cfg(all(target_arch = "x86", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Get a reference to the kernel heap allocator.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn allocator() -> &'static LockedHeap {
    &ALLOCATOR
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod console;
pub mod cpu;
pub mod env;
pub mod error;
pub mod ipc;
pub mod logger;
pub mod mm;
pub mod monitor;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod trap;

pub use error::{KernelError, Result};

/// Heap allocation failure is unrecoverable in the kernel; the
/// alloc_error_handler ABI requires `-> !`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
