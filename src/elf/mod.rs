//! The ELF Emitter (C8): assigns virtual addresses above a page-aligned
//! base, applies relocations, and writes a non-PIE `ET_EXEC` ELF64 image
//! carrying a full static symbol table.

pub mod header;
pub mod program_header;
pub mod section_header;
pub mod sym;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::reloc;
use crate::resolver::{Location, PlanSectionId, ResolutionPlan};
use crate::ro::{Binding, SectionKind};
use crate::strtab::StrtabBuilder;
use header::Ehdr;
use program_header::{Phdr, PF_R, PF_W, PF_X, PT_LOAD, PT_PHDR, SIZEOF_PHDR};
use scroll::{Pwrite, SizeWith};
use section_header::{
    Shdr, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS, SHT_NULL, SHT_PROGBITS, SHT_STRTAB,
    SHT_SYMTAB, SIZEOF_SHDR,
};
use std::fs;
use sym::{st_info, Sym, STB_GLOBAL, STT_FUNC, STT_OBJECT, SIZEOF_SYM};

const PAGE_SIZE: u64 = 0x1000;
const FILE_ALIGN: u64 = 8;

fn align_up(x: u64, align: u64) -> u64 {
    (x + align - 1) / align * align
}

struct LaidSection {
    id: PlanSectionId,
    name_off: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_addralign: u64,
    is_nobits: bool,
}

pub fn emit(ctx: &Context, job: &Job, plan: &mut ResolutionPlan) -> Result<()> {
    let image_base = job.default_image_base();

    let mut shstrtab = StrtabBuilder::new();
    let mut laid = Vec::new();
    let mut current_va = image_base + PAGE_SIZE;

    for id in plan.section_ids() {
        let section = plan.section(id);
        let is_nobits = section.kind == SectionKind::Bss;
        let align = section.align.max(1) as u64;
        current_va = align_up(current_va, align);
        let sh_addr = current_va;
        let sh_size = section.mem_size.max(section.data.len() as u32) as u64;
        current_va += sh_size;

        let sh_flags = SHF_ALLOC
            | if section.flags.write { SHF_WRITE } else { 0 }
            | if section.flags.exec { SHF_EXECINSTR } else { 0 };

        laid.push(LaidSection {
            id,
            name_off: shstrtab.add(&section.name),
            sh_type: if is_nobits { SHT_NOBITS } else { SHT_PROGBITS },
            sh_flags,
            sh_addr,
            sh_offset: 0, // filled in during the file-layout pass
            sh_size,
            sh_addralign: align,
            is_nobits,
        });
    }

    let shstrtab_name = shstrtab.add(".shstrtab");
    let symtab_name = shstrtab.add(".symtab");
    let strtab_name = shstrtab.add(".strtab");

    // Apply relocations; ELF output here is never position-independent, so
    // every `Location::Section` target already has its final address.
    let section_va = |id: PlanSectionId, laid: &[LaidSection]| -> u64 {
        laid.iter().find(|l| l.id == id).map(|l| l.sh_addr).unwrap_or(0)
    };
    for r in plan.relocations.clone() {
        let patch_section_va = section_va(r.section, &laid);
        let patch_site_va = patch_section_va + r.offset;
        let target = match plan.symbols[r.symbol.0].location {
            Location::Section { section, offset } => {
                reloc::Target::Address(section_va(section, &laid) + offset)
            }
            Location::Import(_) | Location::Unresolved => reloc::Target::Unresolved,
        };
        let data = plan.section_data_mut(r.section);
        reloc::apply(data, r.offset as usize, r.kind, patch_site_va, r.addend as i64, target);
    }

    // Static symbol table: the resolved Global symbols, plus the mandatory
    // leading null entry.
    let mut strtab = StrtabBuilder::new();
    let mut symtab_bytes = vec![0u8; SIZEOF_SYM]; // index 0: null entry
    for symbol in &plan.symbols {
        if symbol.binding != Binding::Global {
            continue;
        }
        if let Location::Section { section, offset } = symbol.location {
            let kind = match plan.section(section).kind {
                SectionKind::Code => STT_FUNC,
                _ => STT_OBJECT,
            };
            let name_off = strtab.add(&symbol.name);
            let shndx = laid.iter().position(|l| l.id == section).unwrap_or(0) as u16 + 1;
            let rec = Sym {
                st_name: name_off,
                st_info: st_info(STB_GLOBAL, kind),
                st_other: 0,
                st_shndx: shndx,
                st_value: section_va(section, &laid) + offset,
                st_size: 0,
            };
            let off = symtab_bytes.len();
            symtab_bytes.resize(off + SIZEOF_SYM, 0);
            symtab_bytes.pwrite_with(rec, off, scroll::LE)?;
        }
    }

    let n_alloc = laid.len();
    let n_sections = 1 /* null */ + n_alloc + 3 /* .shstrtab .symtab .strtab */;

    let phdr_count = 1 /* PT_PHDR */ + n_alloc;
    let ehdr_size = Ehdr::size_with(&scroll::LE) as u64;
    let phdr_offset = ehdr_size;
    let phdr_total = phdr_count as u64 * SIZEOF_PHDR as u64;

    // File layout: Ehdr, Phdrs, each allocatable section's raw bytes
    // (file-aligned), .shstrtab, .symtab, .strtab, then the section headers.
    let mut file_cursor = phdr_offset + phdr_total;
    for section in &mut laid {
        if section.is_nobits {
            continue;
        }
        file_cursor = align_up(file_cursor, FILE_ALIGN);
        section.sh_offset = file_cursor;
        file_cursor += section.sh_size;
    }
    file_cursor = align_up(file_cursor, FILE_ALIGN);
    let shstrtab_bytes = shstrtab.into_bytes();
    let shstrtab_offset = file_cursor;
    file_cursor += shstrtab_bytes.len() as u64;

    file_cursor = align_up(file_cursor, FILE_ALIGN);
    let symtab_offset = file_cursor;
    file_cursor += symtab_bytes.len() as u64;

    file_cursor = align_up(file_cursor, FILE_ALIGN);
    let strtab_bytes = strtab.into_bytes();
    let strtab_offset = file_cursor;
    file_cursor += strtab_bytes.len() as u64;

    let shdr_offset = align_up(file_cursor, FILE_ALIGN);

    let entry = match plan.entry {
        Some((section, offset)) => section_va(section, &laid) + offset,
        None => {
            log::warn!("no entry point resolved; e_entry left at 0");
            0
        }
    };

    let ehdr = Ehdr {
        e_entry: entry,
        e_phoff: phdr_offset,
        e_shoff: shdr_offset,
        e_phnum: phdr_count as u16,
        e_shnum: n_sections as u16,
        e_shstrndx: (1 + n_alloc) as u16,
        ..Default::default()
    };

    let mut phdrs = Vec::with_capacity(phdr_count);
    phdrs.push(Phdr {
        p_type: PT_PHDR,
        p_flags: PF_R,
        p_offset: phdr_offset,
        p_vaddr: image_base + phdr_offset,
        p_paddr: image_base + phdr_offset,
        p_filesz: phdr_total,
        p_memsz: phdr_total,
        p_align: 8,
    });
    for section in &laid {
        let mut flags = PF_R;
        if section.sh_flags & SHF_WRITE != 0 {
            flags |= PF_W;
        }
        if section.sh_flags & SHF_EXECINSTR != 0 {
            flags |= PF_X;
        }
        phdrs.push(Phdr {
            p_type: PT_LOAD,
            p_flags: flags,
            p_offset: section.sh_offset,
            p_vaddr: section.sh_addr,
            p_paddr: section.sh_addr,
            p_filesz: if section.is_nobits { 0 } else { section.sh_size },
            p_memsz: section.sh_size,
            p_align: PAGE_SIZE,
        });
    }

    let mut shdrs = Vec::with_capacity(n_sections);
    shdrs.push(Shdr {
        sh_type: SHT_NULL,
        ..Default::default()
    });
    for section in &laid {
        shdrs.push(Shdr {
            sh_name: section.name_off,
            sh_type: section.sh_type,
            sh_flags: section.sh_flags,
            sh_addr: section.sh_addr,
            sh_offset: section.sh_offset,
            sh_size: section.sh_size,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: section.sh_addralign,
            sh_entsize: 0,
        });
    }
    shdrs.push(Shdr {
        sh_name: shstrtab_name,
        sh_type: SHT_STRTAB,
        sh_offset: shstrtab_offset,
        sh_size: shstrtab_bytes.len() as u64,
        sh_addralign: 1,
        ..Default::default()
    });
    shdrs.push(Shdr {
        sh_name: symtab_name,
        sh_type: SHT_SYMTAB,
        sh_offset: symtab_offset,
        sh_size: symtab_bytes.len() as u64,
        sh_link: (1 + n_alloc + 2) as u32, // index of .strtab
        sh_info: 1,                        // one past the last local symbol (none here)
        sh_addralign: 8,
        sh_entsize: SIZEOF_SYM as u64,
        ..Default::default()
    });
    shdrs.push(Shdr {
        sh_name: strtab_name,
        sh_type: SHT_STRTAB,
        sh_offset: strtab_offset,
        sh_size: strtab_bytes.len() as u64,
        sh_addralign: 1,
        ..Default::default()
    });

    let mut out = vec![0u8; shdr_offset as usize + n_sections * SIZEOF_SHDR];
    out.pwrite_with(ehdr, 0, scroll::LE)?;
    let mut off = phdr_offset as usize;
    for phdr in &phdrs {
        out.pwrite_with(*phdr, off, scroll::LE)?;
        off += SIZEOF_PHDR;
    }
    for section in &laid {
        if section.is_nobits {
            continue;
        }
        let bytes = &plan.section(section.id).data;
        let start = section.sh_offset as usize;
        out[start..start + bytes.len()].copy_from_slice(bytes);
    }
    out[shstrtab_offset as usize..shstrtab_offset as usize + shstrtab_bytes.len()]
        .copy_from_slice(&shstrtab_bytes);
    out[symtab_offset as usize..symtab_offset as usize + symtab_bytes.len()]
        .copy_from_slice(&symtab_bytes);
    out[strtab_offset as usize..strtab_offset as usize + strtab_bytes.len()]
        .copy_from_slice(&strtab_bytes);
    let mut shoff = shdr_offset as usize;
    for shdr in &shdrs {
        out.pwrite_with(*shdr, shoff, scroll::LE)?;
        shoff += SIZEOF_SHDR;
    }

    log::debug!("ELF image: {} sections, {} bytes", n_sections, out.len());
    fs::write(&job.output_path, out).map_err(Error::Io)?;
    ctx.destroy();
    Ok(())
}
