//! Loader and writer for the Relocatable Object (RO) wire format: the
//! in-house object format this linker consumes from its (external) compiler.
//!
//! All structures are little-endian and packed; field widths here are the
//! authoritative source for each record's total size where the format's
//! prose label and its field list disagree (see `DESIGN.md`).

use crate::context::Context;
use crate::error::{Error, Result};
use crate::strtab::Strtab;
use scroll::{Pread, Pwrite, SizeWith};

pub const MAGIC: u32 = 0x4523_454F;
pub const VERSION: u16 = 1;

pub const ARCH_X86_64: u16 = 0x8664;
pub const ARCH_ARM64: u16 = 0xAA64;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub arch: u16,
    pub reserved: u16,
    pub sec_count: u32,
    pub sym_count: u32,
    pub strtab_size: u64,
    pub entry_point: u64,
}

pub const SECTION_TEXT: usize = 0;
pub const SECTION_DATA: usize = 1;
pub const SECTION_RODATA: usize = 2;
pub const SECTION_BSS: usize = 3;
pub const FIXED_SECTION_COUNT: u32 = 4;

pub const SECTION_FLAG_READ: u8 = 1;
pub const SECTION_FLAG_WRITE: u8 = 2;
pub const SECTION_FLAG_EXEC: u8 = 4;
pub const SECTION_FLAG_BSS: u8 = 8;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct SectionDescriptor {
    pub name: [u8; 8],
    pub align_log2: u8,
    pub flags: u8,
    pub reserved: u16,
    pub file_offset: u32,
    pub file_size: u32,
    pub mem_size: u32,
    pub reloc_count: u32,
    pub reloc_offset: u32,
}

pub const RELOC_ABS64: u16 = 0;
pub const RELOC_PC32: u16 = 1;
pub const RELOC_GOTPC32: u16 = 2;
pub const RELOC_SECREL32: u16 = 3;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pread, Pwrite, SizeWith)]
pub struct RelocationRecord {
    pub offset: u64,
    pub sym_idx: u32,
    pub kind: u16,
    pub addend: i16,
}

pub const SYM_TYPE_NOTYPE: u8 = 0;
pub const SYM_TYPE_FUNC: u8 = 1;
pub const SYM_TYPE_OBJECT: u8 = 2;

pub const SYM_BIND_LOCAL: u8 = 0;
pub const SYM_BIND_GLOBAL: u8 = 1;
pub const SYM_BIND_WEAK: u8 = 2;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Pread, Pwrite, SizeWith)]
pub struct SymbolRecord {
    pub name: [u8; 24],
    pub value: u64,
    pub sec_idx: u32,
    pub kind: u8,
    pub bind: u8,
    pub reserved: u16,
}

impl Default for SymbolRecord {
    fn default() -> Self {
        SymbolRecord {
            name: [0; 24],
            value: 0,
            sec_idx: 0,
            kind: SYM_TYPE_NOTYPE,
            bind: SYM_BIND_LOCAL,
            reserved: 0,
        }
    }
}

/// In-memory form of one loaded section. `data` is absent (empty) for BSS;
/// `mem_size` always carries the section's in-memory extent.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub kind: SectionKind,
    pub flags: SectionFlags,
    pub align: u32,
    pub data: Vec<u8>,
    pub mem_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Code,
    Data,
    Rodata,
    Bss,
    Tls,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionFlags {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local,
    Global,
    Weak,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Default,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    NoType,
    Func,
    Object,
}

/// In-memory symbol. `section_index` is `None` for undefined (external)
/// symbols; otherwise it indexes the owning TU's `sections`.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub section_index: Option<usize>,
    pub value: u64,
    pub size: u64,
    pub binding: Binding,
    pub visibility: Visibility,
    pub kind: SymbolType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationKind {
    Abs64,
    Pc32,
    GotPc32,
    Secrel32,
}

#[derive(Debug, Clone)]
pub struct Relocation {
    pub section_index: usize,
    pub offset: u64,
    pub kind: RelocationKind,
    pub symbol_index: u32,
    pub addend: i32,
}

/// One loaded RO file.
#[derive(Debug, Clone)]
pub struct TranslationUnit {
    pub path: String,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub relocations: Vec<Relocation>,
    pub entry_offset: Option<u64>,
}

fn name_from_fixed(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Parse one RO byte blob into a [`TranslationUnit`].
pub fn load(ctx: &Context, path: String, bytes: &[u8]) -> Result<TranslationUnit> {
    let header: FileHeader = bytes
        .pread_with(0, scroll::LE)
        .map_err(|_| Error::BadFormat(format!("{}: truncated RO header", path)))?;

    if header.magic != MAGIC {
        return Err(Error::BadFormat(format!(
            "{}: bad RO magic {:#x}",
            path, header.magic
        )));
    }
    if header.version != VERSION {
        return Err(Error::BadFormat(format!(
            "{}: unsupported RO version {}",
            path, header.version
        )));
    }

    let header_size = FileHeader::size_with(&scroll::LE);
    let sec_desc_size = SectionDescriptor::size_with(&scroll::LE);
    let mut offset = header_size;

    let mut descriptors = Vec::with_capacity(header.sec_count as usize);
    for _ in 0..header.sec_count {
        let desc: SectionDescriptor = bytes.pread_with(offset, scroll::LE).map_err(|_| {
            Error::BadFormat(format!("{}: truncated section descriptor", path))
        })?;
        offset += sec_desc_size;
        descriptors.push(desc);
    }

    // String table sits at the very end of the file.
    if header.strtab_size as usize > bytes.len() {
        return Err(Error::BadFormat(format!(
            "{}: string table size exceeds file length",
            path
        )));
    }
    let strtab_offset = bytes.len() - header.strtab_size as usize;
    let strtab = Strtab::new(&bytes[strtab_offset..]);

    let mut sections = Vec::with_capacity(descriptors.len());
    for (i, desc) in descriptors.iter().enumerate() {
        let is_bss = desc.flags & SECTION_FLAG_BSS != 0;
        let data = if is_bss {
            // Materialized zeroed so the relocation engine has a mutable
            // buffer to patch into, even though BSS carries no file bytes.
            vec![0u8; desc.mem_size as usize]
        } else {
            let start = desc.file_offset as usize;
            let end = start
                .checked_add(desc.file_size as usize)
                .ok_or_else(|| Error::BadFormat(format!("{}: section {} overflow", path, i)))?;
            if end > bytes.len() {
                return Err(Error::BadFormat(format!(
                    "{}: section {} extends past end of file",
                    path, i
                )));
            }
            ctx.arena_alloc(&bytes[start..end]).to_vec()
        };

        let kind = match i {
            SECTION_TEXT => SectionKind::Code,
            SECTION_DATA => SectionKind::Data,
            SECTION_RODATA => SectionKind::Rodata,
            SECTION_BSS => SectionKind::Bss,
            _ => SectionKind::Data,
        };

        sections.push(Section {
            name: name_from_fixed(&desc.name),
            kind,
            flags: SectionFlags {
                read: desc.flags & SECTION_FLAG_READ != 0,
                write: desc.flags & SECTION_FLAG_WRITE != 0,
                exec: desc.flags & SECTION_FLAG_EXEC != 0,
            },
            align: 1u32 << desc.align_log2,
            data,
            mem_size: desc.mem_size,
        });
    }

    // Relocations, one table per section.
    let mut relocations = Vec::new();
    for (i, desc) in descriptors.iter().enumerate() {
        if desc.reloc_count == 0 {
            continue;
        }
        let reloc_rec_size = RelocationRecord::size_with(&scroll::LE);
        let mut roff = desc.reloc_offset as usize;
        let needed = roff
            .checked_add(reloc_rec_size * desc.reloc_count as usize)
            .ok_or_else(|| Error::BadFormat(format!("{}: relocation table overflow", path)))?;
        if needed > bytes.len() {
            return Err(Error::BadFormat(format!(
                "{}: relocation table for section {} extends past end of file",
                path, i
            )));
        }
        for _ in 0..desc.reloc_count {
            let rec: RelocationRecord = bytes.pread_with(roff, scroll::LE)?;
            roff += reloc_rec_size;
            let kind = match rec.kind {
                RELOC_ABS64 => RelocationKind::Abs64,
                RELOC_PC32 => RelocationKind::Pc32,
                RELOC_GOTPC32 => RelocationKind::GotPc32,
                RELOC_SECREL32 => RelocationKind::Secrel32,
                other => {
                    return Err(Error::BadFormat(format!(
                        "{}: unknown relocation type {}",
                        path, other
                    )))
                }
            };
            relocations.push(Relocation {
                section_index: i,
                offset: rec.offset,
                kind,
                symbol_index: rec.sym_idx,
                addend: rec.addend as i32,
            });
        }
    }

    // Symbol table: directly follows the section descriptors.
    let sym_rec_size = SymbolRecord::size_with(&scroll::LE);
    let mut symbols = Vec::with_capacity(header.sym_count as usize);
    for _ in 0..header.sym_count {
        let rec: SymbolRecord = bytes.pread_with(offset, scroll::LE).map_err(|_| {
            Error::BadFormat(format!("{}: truncated symbol record", path))
        })?;
        offset += sym_rec_size;

        let raw_name = name_from_fixed(&rec.name);
        let name = if raw_name.starts_with('#') && raw_name.len() == 9 {
            // long-name hash marker: the real name lives in the string table.
            resolve_long_name(&strtab, &raw_name)
                .unwrap_or(raw_name)
        } else {
            raw_name
        };
        // Route every loaded name through the interner so identical content
        // always yields the same canonical `String` instance (Testable
        // Property 2), even though the rest of the crate still stores names
        // as plain `String`s rather than threading `DefaultSymbol` handles
        // through every structure.
        let name = ctx.resolve(ctx.intern(&name));

        let binding = match rec.bind {
            SYM_BIND_LOCAL => Binding::Local,
            SYM_BIND_GLOBAL => Binding::Global,
            SYM_BIND_WEAK => Binding::Weak,
            other => {
                return Err(Error::BadFormat(format!("bad symbol binding {}", other)))
            }
        };
        let kind = match rec.kind {
            SYM_TYPE_NOTYPE => SymbolType::NoType,
            SYM_TYPE_FUNC => SymbolType::Func,
            SYM_TYPE_OBJECT => SymbolType::Object,
            other => return Err(Error::BadFormat(format!("bad symbol type {}", other))),
        };

        symbols.push(Symbol {
            name,
            section_index: if rec.sec_idx == 0 {
                None
            } else {
                Some(rec.sec_idx as usize - 1)
            },
            value: rec.value,
            size: 0,
            binding,
            visibility: Visibility::Default,
            kind,
        });
    }

    let entry_offset = if header.entry_point == 0 {
        None
    } else {
        Some(header.entry_point)
    };

    Ok(TranslationUnit {
        path,
        sections,
        symbols,
        relocations,
        entry_offset,
    })
}

/// FNV-1a over the name's UTF-8 bytes; the hash embedded in a `'#'`-prefixed
/// marker for names too long to inline (§6.1).
pub fn fnv1a(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in name.as_bytes() {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Scan the string table for the entry whose hash matches a `'#' + 8 hex
/// digit` marker. Ties (hash collisions) are not disambiguated further —
/// the first match wins, matching the format's documented best-effort
/// lookup for over-length names.
fn resolve_long_name(strtab: &Strtab<'_>, marker: &str) -> Option<String> {
    let target = u32::from_str_radix(&marker[1..], 16).ok()?;
    let mut offset = 1usize; // offset 0 is the empty string
    while let Some(s) = strtab.get(offset) {
        if !s.is_empty() && fnv1a(s) == target {
            return Some(s.to_string());
        }
        offset += s.len() + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_job() -> crate::job::Job {
        crate::job::Job {
            target: crate::job::Target::Elf,
            output_kind: crate::job::OutputKind::Executable,
            output_path: std::path::PathBuf::from("/tmp/ferrolink-test-out"),
            inputs: vec![crate::job::InputSource::Memory {
                label: "x".into(),
                bytes: vec![],
            }],
            config: Default::default(),
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let ctx = Context::create(&test_job()).unwrap();
        let bytes = [0u8; 32];
        let err = load(&ctx, "t".into(), &bytes).unwrap_err();
        assert!(matches!(err, Error::BadFormat(_)));
    }

    #[test]
    fn fnv1a_is_stable() {
        assert_eq!(fnv1a("main"), fnv1a("main"));
        assert_ne!(fnv1a("main"), fnv1a("other"));
    }
}
