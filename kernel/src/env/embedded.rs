//! Embedded init image
//!
//! The first environment comes from a minimal ELF32 binary embedded
//! directly in the kernel image, so the kernel boots to user mode
//! without any boot-media filesystem. The machine code is hand
//! assembled below; `init_image` wraps it in a one-segment ELF the
//! program loader accepts.

use alloc::vec::Vec;

// ---------------------------------------------------------------------------
// ELF32 layout constants
// ---------------------------------------------------------------------------

/// Size of the ELF32 header (bytes).
const ELF32_EHDR_SIZE: usize = 52;

/// Size of one ELF32 program header entry (bytes).
const ELF32_PHDR_SIZE: usize = 32;

/// File offset where code begins (immediately after the headers).
const CODE_OFFSET: usize = ELF32_EHDR_SIZE + ELF32_PHDR_SIZE; // 0x54

/// User-space load address of the whole image. The file is mapped from
/// offset 0, so execution starts at `INIT_LOAD_ADDR + CODE_OFFSET`.
pub const INIT_LOAD_ADDR: u32 = 0x0080_0000;

// ---------------------------------------------------------------------------
// i386 machine code for the init environment
// ---------------------------------------------------------------------------

/// Machine code for the minimal init environment.
///
/// Prints a greeting through `cputs` (call 0, arguments in edx/ecx),
/// then yields forever (call 11). The software-interrupt vector is
/// 0x30. i386 has no IP-relative addressing, so the message operand is
/// the absolute address `INIT_LOAD_ADDR + CODE_OFFSET + 26`.
///
/// Disassembly:
/// ```text
///   0: b8 00 00 00 00          mov  eax, 0           ; cputs
///   5: ba 6e 00 80 00          mov  edx, 0x0080006e  ; buf = &msg
///  10: b9 1c 00 00 00          mov  ecx, 28          ; len = 28
///  15: cd 30                   int  0x30
///  17: b8 0b 00 00 00          mov  eax, 11          ; yield
///  22: cd 30                   int  0x30
///  24: eb f7                   jmp  0x11             ; back to yield
///  26: "init: hello from user space\n"
/// ```
const INIT_CODE: &[u8] = &[
    // mov eax, 0  (cputs)
    0xb8, 0x00, 0x00, 0x00, 0x00,
    // mov edx, INIT_LOAD_ADDR + CODE_OFFSET + 26
    0xba, 0x6e, 0x00, 0x80, 0x00,
    // mov ecx, 28
    0xb9, 0x1c, 0x00, 0x00, 0x00,
    // int 0x30
    0xcd, 0x30,
    // mov eax, 11  (yield)
    0xb8, 0x0b, 0x00, 0x00, 0x00,
    // int 0x30
    0xcd, 0x30,
    // jmp -9  (back to the yield)
    0xeb, 0xf7,
    // msg: "init: hello from user space\n" (28 bytes)
    b'i', b'n', b'i', b't', b':', b' ', b'h', b'e', b'l', b'l', b'o', b' ', b'f', b'r', b'o', b'm',
    b' ', b'u', b's', b'e', b'r', b' ', b's', b'p', b'a', b'c', b'e', b'\n',
];

// ---------------------------------------------------------------------------
// ELF32 builder
// ---------------------------------------------------------------------------

/// Build a minimal ELF32 executable from raw machine code.
///
/// The binary has a single PT_LOAD segment covering the whole file:
///
/// | Offset | Content               | Size     |
/// |--------|-----------------------|----------|
/// | 0x00   | ELF32 header          | 52 bytes |
/// | 0x34   | Program header (LOAD) | 32 bytes |
/// | 0x54   | Machine code          | variable |
///
/// The entry point is `load_addr + 0x54`, the first byte of `code`.
fn build_minimal_elf(code: &[u8], load_addr: u32) -> Vec<u8> {
    let total_size = CODE_OFFSET + code.len();
    let entry_point = load_addr + CODE_OFFSET as u32;

    let mut elf = Vec::with_capacity(total_size);

    // ELF32 header (52 bytes)
    // e_ident: magic, ELFCLASS32, little-endian, EV_CURRENT, padding
    elf.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
    elf.push(1);
    elf.push(1);
    elf.push(1);
    elf.push(0);
    elf.extend_from_slice(&[0u8; 8]);
    // e_type: ET_EXEC
    elf.extend_from_slice(&2u16.to_le_bytes());
    // e_machine: EM_386
    elf.extend_from_slice(&3u16.to_le_bytes());
    // e_version
    elf.extend_from_slice(&1u32.to_le_bytes());
    // e_entry
    elf.extend_from_slice(&entry_point.to_le_bytes());
    // e_phoff: immediately after this header
    elf.extend_from_slice(&(ELF32_EHDR_SIZE as u32).to_le_bytes());
    // e_shoff, e_flags: none
    elf.extend_from_slice(&0u32.to_le_bytes());
    elf.extend_from_slice(&0u32.to_le_bytes());
    // e_ehsize, e_phentsize, e_phnum
    elf.extend_from_slice(&(ELF32_EHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&(ELF32_PHDR_SIZE as u16).to_le_bytes());
    elf.extend_from_slice(&1u16.to_le_bytes());
    // e_shentsize, e_shnum, e_shstrndx: none
    elf.extend_from_slice(&0u16.to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes());
    elf.extend_from_slice(&0u16.to_le_bytes());

    debug_assert_eq!(elf.len(), ELF32_EHDR_SIZE);

    // Program header: PT_LOAD (32 bytes)
    // p_type
    elf.extend_from_slice(&1u32.to_le_bytes());
    // p_offset: whole file, from the start
    elf.extend_from_slice(&0u32.to_le_bytes());
    // p_vaddr, p_paddr
    elf.extend_from_slice(&load_addr.to_le_bytes());
    elf.extend_from_slice(&load_addr.to_le_bytes());
    // p_filesz, p_memsz
    elf.extend_from_slice(&(total_size as u32).to_le_bytes());
    elf.extend_from_slice(&(total_size as u32).to_le_bytes());
    // p_flags: PF_R | PF_X
    elf.extend_from_slice(&5u32.to_le_bytes());
    // p_align
    elf.extend_from_slice(&0x1000u32.to_le_bytes());

    debug_assert_eq!(elf.len(), CODE_OFFSET);

    elf.extend_from_slice(code);

    debug_assert_eq!(elf.len(), total_size);
    elf
}

/// The bootable init image, ready for `load::create`.
pub fn init_image() -> Vec<u8> {
    build_minimal_elf(INIT_CODE, INIT_LOAD_ADDR)
}
