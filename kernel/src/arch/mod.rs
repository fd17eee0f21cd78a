//! Architecture support
//!
//! This kernel targets 32-bit protected-mode x86 only; the submodule
//! split keeps the hardware surface in one place.

pub mod x86;

/// Architecture init for the boot CPU: paging, the serial console, and
/// this CPU's segment state. The IDT is built later by `trap::init`.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn init() {
    x86::paging_init();
    x86::serial::init();
    x86::gdt::init_percpu();
}
