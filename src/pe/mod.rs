//! The PE Emitter (C7): lays out sections, builds `.idata`/`.reloc`,
//! applies relocations, and writes a bit-exact PE32+ executable.

pub mod basereloc;
pub mod header;
pub mod import;
pub mod section_table;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::job::{Job, Subsystem};
use crate::reloc;
use crate::resolver::{Location, PlanSectionId, ResolutionPlan};
use crate::ro::{RelocationKind, SectionKind};
use header::*;
use log::{debug, trace, warn};
use scroll::{Pwrite, SizeWith};
use section_table::SectionHeader;
use std::fs;

const SECTION_ALIGNMENT: u32 = 0x1000;
const FILE_ALIGNMENT: u32 = 0x200;
const MAX_NUMBER_OF_SECTIONS_PE: usize = 65279;
const IMAGE_SCN_MEM_DISCARDABLE: u32 = 0x0200_0000;

fn align_up(x: u32, align: u32) -> u32 {
    (x + align - 1) / align * align
}

struct LaidSection {
    header: SectionHeader,
    vaddr: u32,
    raw_offset: u32,
    raw_size: u32,
    /// `Some(id)` for a section owned by the plan; `None` for a synthetic
    /// section (`.idata`, `.reloc`) whose bytes are tracked separately.
    plan_section: Option<PlanSectionId>,
    synthetic_bytes: Option<Vec<u8>>,
}

pub fn emit(ctx: &Context, job: &Job, plan: &mut ResolutionPlan) -> Result<()> {
    let image_base = job.default_image_base();
    debug!("PE emit: image_base={:#x}", image_base);

    let has_imports = !plan.imports.is_empty();
    let has_abs64 = plan
        .relocations
        .iter()
        .any(|r| r.kind == RelocationKind::Abs64);

    let n_input_sections = plan.section_count();
    let n_sections = n_input_sections + has_imports as usize + has_abs64 as usize;
    if n_sections > MAX_NUMBER_OF_SECTIONS_PE {
        return Err(Error::BackendFailure("too many sections for PE".into()));
    }

    let fixed_header_size = DosHeader::size_with(&scroll::LE)
        + std::mem::size_of::<DosStub>()
        + 4 // PE signature
        + CoffHeader::size_with(&scroll::LE)
        + OptionalHeader64::size_with(&scroll::LE)
        + n_sections * SectionHeader::size_with(&scroll::LE);
    let headers_size = align_up(fixed_header_size as u32, FILE_ALIGNMENT);

    let mut current_va = headers_size;
    let mut current_raw = headers_size;
    let mut laid: Vec<LaidSection> = Vec::with_capacity(n_sections);

    for id in plan.section_ids() {
        let section = plan.section(id);
        let is_bss = section.kind == SectionKind::Bss;
        current_va = align_up(current_va, SECTION_ALIGNMENT);
        let vaddr = current_va;
        let virtual_size = section.mem_size.max(section.data.len() as u32).max(1);
        current_va += virtual_size.max(SECTION_ALIGNMENT);

        let (raw_offset, raw_size) = if is_bss {
            (0u32, 0u32)
        } else {
            current_raw = align_up(current_raw, FILE_ALIGNMENT);
            let size = align_up(section.data.len() as u32, FILE_ALIGNMENT);
            let offset = current_raw;
            current_raw += size;
            (offset, size)
        };

        let characteristics = match section.kind {
            SectionKind::Code => {
                section_table::IMAGE_SCN_CNT_CODE
                    | section_table::IMAGE_SCN_MEM_EXECUTE
                    | section_table::IMAGE_SCN_MEM_READ
            }
            SectionKind::Data => {
                section_table::IMAGE_SCN_CNT_INITIALIZED_DATA
                    | section_table::IMAGE_SCN_MEM_READ
                    | section_table::IMAGE_SCN_MEM_WRITE
            }
            SectionKind::Rodata => {
                section_table::IMAGE_SCN_CNT_INITIALIZED_DATA | section_table::IMAGE_SCN_MEM_READ
            }
            SectionKind::Bss | SectionKind::Tls => {
                section_table::IMAGE_SCN_CNT_UNINITIALIZED_DATA
                    | section_table::IMAGE_SCN_MEM_READ
                    | section_table::IMAGE_SCN_MEM_WRITE
            }
        };

        let mut header = SectionHeader::with_name(&section.name);
        header.virtual_size = virtual_size;
        header.virtual_address = vaddr;
        header.size_of_raw_data = raw_size;
        header.pointer_to_raw_data = raw_offset;
        header.characteristics = characteristics;

        trace!(
            "section {} vaddr={:#x} raw_offset={:#x} raw_size={:#x}",
            section.name, vaddr, raw_offset, raw_size
        );

        laid.push(LaidSection {
            header,
            vaddr,
            raw_offset,
            raw_size,
            plan_section: Some(id),
            synthetic_bytes: None,
        });
    }

    // `.idata`
    let mut idata_layout = None;
    if has_imports {
        current_va = align_up(current_va, SECTION_ALIGNMENT);
        let idata_vaddr = current_va;
        let layout = import::build(&plan.imports, idata_vaddr);
        let size = layout.bytes.len() as u32;
        current_va += size.max(SECTION_ALIGNMENT);

        current_raw = align_up(current_raw, FILE_ALIGNMENT);
        let raw_offset = current_raw;
        let raw_size = align_up(size, FILE_ALIGNMENT);
        current_raw += raw_size;

        let mut header = SectionHeader::with_name(".idata");
        header.virtual_size = size;
        header.virtual_address = idata_vaddr;
        header.size_of_raw_data = raw_size;
        header.pointer_to_raw_data = raw_offset;
        header.characteristics = section_table::IMAGE_SCN_CNT_INITIALIZED_DATA
            | section_table::IMAGE_SCN_MEM_READ
            | section_table::IMAGE_SCN_MEM_WRITE;

        laid.push(LaidSection {
            header,
            vaddr: idata_vaddr,
            raw_offset,
            raw_size,
            plan_section: None,
            synthetic_bytes: Some(layout.bytes.clone()),
        });
        idata_layout = Some(layout);
    }

    // Apply relocations now that every non-`.reloc` section has a final RVA.
    // `laid` already carries every section's final vaddr, so resolving a
    // target RVA never needs to borrow `plan`.
    fn section_va(id: PlanSectionId, laid: &[LaidSection]) -> u32 {
        laid.iter()
            .find(|l| l.plan_section == Some(id))
            .map(|l| l.vaddr)
            .unwrap_or(0)
    }

    let mut abs64_sites = Vec::new();
    for r in plan.relocations.clone() {
        let patch_section_va = section_va(r.section, &laid);
        let patch_site_va = image_base + patch_section_va as u64 + r.offset;

        // An import's address has no addend term (SPEC_FULL.md's `S` for an
        // import is `image_base + iat_rva`, full stop); only a defined
        // symbol's address folds `relocation.addend` in.
        let (target, addend) = match plan.symbols[r.symbol.0].location {
            Location::Section { section, offset } => {
                let addr = image_base + section_va(section, &laid) as u64 + offset;
                (reloc::Target::Address(addr), r.addend as i64)
            }
            Location::Import(import_id) => {
                let binding = &plan.imports[import_id.0];
                let target = match idata_layout.as_ref().and_then(|l| {
                    l.iat_entry_rva
                        .get(&(binding.module.clone(), binding.symbol.clone()))
                }) {
                    Some(&rva) => reloc::Target::Address(image_base + rva as u64),
                    None => reloc::Target::Unresolved,
                };
                (target, 0i64)
            }
            Location::Unresolved => (reloc::Target::Unresolved, 0i64),
        };

        let data = plan.section_data_mut(r.section);
        let patched = reloc::apply(
            data,
            r.offset as usize,
            r.kind,
            patch_site_va,
            addend,
            target,
        );
        if patched && r.kind == RelocationKind::Abs64 {
            abs64_sites.push((patch_section_va as u64 + r.offset) as u32);
        }
    }

    // `.reloc`
    let mut reloc_bytes = None;
    let mut reloc_vaddr = 0u32;
    if has_abs64 {
        current_va = align_up(current_va, SECTION_ALIGNMENT);
        reloc_vaddr = current_va;
        let bytes = basereloc::build(&abs64_sites);
        let size = bytes.len() as u32;
        current_va += size.max(SECTION_ALIGNMENT);

        current_raw = align_up(current_raw, FILE_ALIGNMENT);
        let raw_offset = current_raw;
        let raw_size = align_up(size, FILE_ALIGNMENT);
        current_raw += raw_size;

        let mut header = SectionHeader::with_name(".reloc");
        header.virtual_size = size;
        header.virtual_address = reloc_vaddr;
        header.size_of_raw_data = raw_size;
        header.pointer_to_raw_data = raw_offset;
        header.characteristics = section_table::IMAGE_SCN_CNT_INITIALIZED_DATA
            | section_table::IMAGE_SCN_MEM_READ
            | IMAGE_SCN_MEM_DISCARDABLE;

        laid.push(LaidSection {
            header,
            vaddr: reloc_vaddr,
            raw_offset,
            raw_size,
            plan_section: None,
            synthetic_bytes: Some(bytes.clone()),
        });
        reloc_bytes = Some(bytes);
    }

    let size_of_image = align_up(current_va, SECTION_ALIGNMENT);

    let entry_rva = match plan.entry {
        Some((section, offset)) => section_va(section, &laid) + offset as u32,
        None => {
            warn!("no entry point resolved; AddressOfEntryPoint left at 0");
            0
        }
    };

    let size_of_code: u32 = laid
        .iter()
        .filter(|l| l.header.characteristics & section_table::IMAGE_SCN_CNT_CODE != 0)
        .map(|l| l.raw_size)
        .sum();
    let size_of_initialized_data: u32 = laid
        .iter()
        .filter(|l| l.header.characteristics & section_table::IMAGE_SCN_CNT_INITIALIZED_DATA != 0)
        .map(|l| l.raw_size)
        .sum();

    let mut dll_characteristics = DLL_CHARACTERISTICS_NX_COMPAT;
    if has_abs64 {
        dll_characteristics |= DLL_CHARACTERISTICS_DYNAMIC_BASE;
    }

    let subsystem = match job.config.subsystem.unwrap_or(Subsystem::Console) {
        Subsystem::Console => IMAGE_SUBSYSTEM_WINDOWS_CUI,
        Subsystem::Windows => IMAGE_SUBSYSTEM_WINDOWS_GUI,
    };

    let mut optional_header = OptionalHeader64 {
        size_of_code,
        size_of_initialized_data,
        size_of_uninitialized_data: 0,
        address_of_entry_point: entry_rva,
        base_of_code: laid.first().map(|l| l.vaddr).unwrap_or(0),
        image_base,
        section_alignment: SECTION_ALIGNMENT,
        file_alignment: FILE_ALIGNMENT,
        size_of_image,
        size_of_headers: headers_size,
        subsystem,
        dll_characteristics,
        size_of_stack_reserve: job.config.stack_size.unwrap_or(0x10_0000),
        ..Default::default()
    };
    if let Some(l) = &idata_layout {
        optional_header.data_directory[DIR_IMPORT] = DataDirectory {
            virtual_address: l.import_directory_rva,
            size: l.import_directory_size,
        };
        optional_header.data_directory[DIR_IAT] = DataDirectory {
            virtual_address: l.iat_rva,
            size: l.iat_size,
        };
    }
    if reloc_bytes.is_some() {
        optional_header.data_directory[DIR_BASE_RELOC] = DataDirectory {
            virtual_address: reloc_vaddr,
            size: reloc_bytes.as_ref().unwrap().len() as u32,
        };
    }

    let coff_header = CoffHeader {
        machine: COFF_MACHINE_X86_64,
        number_of_sections: n_sections as u16,
        time_date_stamp: 0,
        pointer_to_symbol_table: 0,
        number_of_symbol_table: 0,
        size_of_optional_header: SIZEOF_OPTIONAL_HEADER64,
        characteristics: IMAGE_FILE_EXECUTABLE_IMAGE | IMAGE_FILE_LARGE_ADDRESS_AWARE,
    };

    let mut out = vec![0u8; headers_size as usize];
    let mut off = 0usize;
    let pe_pointer =
        DosHeader::size_with(&scroll::LE) as u32 + std::mem::size_of::<DosStub>() as u32;
    out.pwrite_with(DosHeader::new(pe_pointer), off, scroll::LE)?;
    off += DosHeader::size_with(&scroll::LE);
    out.pwrite_with(DosStub::default(), off, scroll::LE)?;
    off += std::mem::size_of::<DosStub>();
    out.pwrite_with::<u32>(PE_MAGIC, off, scroll::LE)?;
    off += 4;
    out.pwrite_with(coff_header, off, scroll::LE)?;
    off += CoffHeader::size_with(&scroll::LE);
    out.pwrite_with(optional_header, off, scroll::LE)?;
    off += OptionalHeader64::size_with(&scroll::LE);
    for section in &laid {
        out.pwrite_with(section.header, off, scroll::LE)?;
        off += SectionHeader::size_with(&scroll::LE);
    }

    out.resize(current_raw as usize, 0);
    for section in &laid {
        if section.raw_size == 0 {
            continue;
        }
        let bytes: Vec<u8> = match (&section.plan_section, &section.synthetic_bytes) {
            (Some(id), _) => plan.section(*id).data.clone(),
            (None, Some(b)) => b.clone(),
            _ => Vec::new(),
        };
        let end = (section.raw_offset as usize + bytes.len()).min(out.len());
        out[section.raw_offset as usize..end]
            .copy_from_slice(&bytes[..end - section.raw_offset as usize]);
    }

    debug!("PE image: {} sections, {} bytes", laid.len(), out.len());
    fs::write(&job.output_path, out).map_err(Error::Io)?;
    ctx.destroy();
    Ok(())
}
