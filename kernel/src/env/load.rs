//! Program loading
//!
//! Creates the first environments from ELF images baked into the boot
//! media. Only static 32-bit executables are accepted: loadable
//! segments are copied into freshly allocated frames, the gap between
//! file size and memory size is left zeroed, and one page of stack is
//! mapped below `USTACKTOP`.

use super::{EnvId, EnvStatus, EnvTable};
use crate::error::{KernelError, Result};
use crate::mm::{PageAllocator, VirtAddr, PGSIZE, USTACKTOP};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

/// ELF32 file header fields the loader reads.
#[derive(Debug, Clone, Copy)]
struct ElfHeader {
    entry: u32,
    phoff: u32,
    phnum: u16,
}

/// One ELF32 program header.
#[derive(Debug, Clone, Copy)]
struct ProgHeader {
    typ: u32,
    offset: u32,
    vaddr: u32,
    filesz: u32,
    memsz: u32,
}

fn read_u16(image: &[u8], off: usize) -> Result<u16> {
    let bytes = image
        .get(off..off + 2)
        .ok_or(KernelError::Inval)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(image: &[u8], off: usize) -> Result<u32> {
    let bytes = image
        .get(off..off + 4)
        .ok_or(KernelError::Inval)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn parse_header(image: &[u8]) -> Result<ElfHeader> {
    if image.len() < 52 || image[..4] != ELF_MAGIC {
        return Err(KernelError::Inval);
    }
    if read_u16(image, 16)? != ET_EXEC || read_u16(image, 18)? != EM_386 {
        return Err(KernelError::Inval);
    }
    Ok(ElfHeader {
        entry: read_u32(image, 24)?,
        phoff: read_u32(image, 28)?,
        phnum: read_u16(image, 44)?,
    })
}

fn parse_phdr(image: &[u8], base: usize) -> Result<ProgHeader> {
    Ok(ProgHeader {
        typ: read_u32(image, base)?,
        offset: read_u32(image, base + 4)?,
        vaddr: read_u32(image, base + 8)?,
        filesz: read_u32(image, base + 16)?,
        memsz: read_u32(image, base + 20)?,
    })
}

/// Allocate an environment and populate it from `image`. The new
/// environment is left `RUNNABLE` with no parent.
pub fn create(
    table: &mut EnvTable,
    alloc: &mut PageAllocator,
    image: &[u8],
) -> Result<EnvId> {
    let header = parse_header(image)?;

    let id = table.alloc(alloc, EnvId::KERNEL)?;

    let result = (|| {
        for i in 0..header.phnum {
            let ph = parse_phdr(image, header.phoff as usize + i as usize * 32)?;
            if ph.typ != PT_LOAD {
                continue;
            }
            if ph.filesz > ph.memsz {
                return Err(KernelError::Inval);
            }
            let file_end = ph
                .offset
                .checked_add(ph.filesz)
                .ok_or(KernelError::Inval)?;
            let file = image
                .get(ph.offset as usize..file_end as usize)
                .ok_or(KernelError::Inval)?;

            let env = table.env_mut(id)?;
            env.aspace
                .region_alloc(alloc, VirtAddr::new(ph.vaddr), ph.memsz as usize)?;
            // Fresh frames are zeroed, so only the file-backed prefix
            // needs copying; the bss tail is already zero.
            env.aspace.copy_to_user(alloc, VirtAddr::new(ph.vaddr), file);
        }

        let env = table.env_mut(id)?;
        env.aspace.region_alloc(
            alloc,
            VirtAddr::new(USTACKTOP - PGSIZE as u32),
            PGSIZE,
        )?;
        env.tf.set_entry_point(VirtAddr::new(header.entry));
        env.status = EnvStatus::Runnable;
        Ok(id)
    })();

    if result.is_err() {
        table.free(alloc, id, EnvId::KERNEL);
    }
    result
}
