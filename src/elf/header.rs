//! The ELF64 file header (`Ehdr`, 64 bytes, §6.3).

use scroll::{Pread, Pwrite, SizeWith};

pub const SIZEOF_IDENT: usize = 16;
pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;
pub const ELFOSABI_SYSV: u8 = 0;

pub const ET_EXEC: u16 = 2;
pub const EM_X86_64: u16 = 62;

pub const SIZEOF_EHDR: usize = 64;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Pread, Pwrite, SizeWith)]
pub struct Ehdr {
    pub e_ident: [u8; SIZEOF_IDENT],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl Default for Ehdr {
    fn default() -> Self {
        let mut e_ident = [0u8; SIZEOF_IDENT];
        e_ident[0..4].copy_from_slice(&ELFMAG);
        e_ident[4] = ELFCLASS64;
        e_ident[5] = ELFDATA2LSB;
        e_ident[6] = EV_CURRENT;
        e_ident[7] = ELFOSABI_SYSV;
        Ehdr {
            e_ident,
            e_type: ET_EXEC,
            e_machine: EM_X86_64,
            e_version: EV_CURRENT as u32,
            e_entry: 0,
            e_phoff: 0,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: SIZEOF_EHDR as u16,
            e_phentsize: crate::elf::program_header::SIZEOF_PHDR as u16,
            e_phnum: 0,
            e_shentsize: crate::elf::section_header::SIZEOF_SHDR as u16,
            e_shnum: 0,
            e_shstrndx: 0,
        }
    }
}
