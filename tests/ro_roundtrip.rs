//! Testable Property 1: a well-formed RO blob round-trips through the
//! loader with every declared field preserved exactly.

use ferrolink::context::Context;
use ferrolink::job::{InputSource, Job, JobConfig, OutputKind, Target};
use ferrolink::ro::{self, FileHeader, SectionDescriptor, SymbolRecord};
use scroll::{Pwrite, SizeWith};

fn test_job() -> Job {
    Job {
        target: Target::Elf,
        output_kind: OutputKind::Executable,
        output_path: std::path::PathBuf::from("/tmp/ferrolink-ro-roundtrip-test"),
        inputs: vec![InputSource::Memory {
            label: "unused".into(),
            bytes: vec![],
        }],
        config: JobConfig::default(),
    }
}

fn fixed_name(name: &str, width: usize) -> Vec<u8> {
    let mut buf = vec![0u8; width];
    let bytes = name.as_bytes();
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

#[test]
fn loads_a_minimal_single_section_object() {
    let header_size = FileHeader::size_with(&scroll::LE);
    let desc_size = SectionDescriptor::size_with(&scroll::LE);
    let sym_size = SymbolRecord::size_with(&scroll::LE);

    let text_offset = header_size + desc_size;
    let text_bytes = [0x90u8, 0x90, 0x90, 0xC3];
    let sym_offset = text_offset + text_bytes.len();
    let strtab_offset = sym_offset + sym_size;
    let strtab_bytes = [0u8]; // just the empty-string sentinel

    let total = strtab_offset + strtab_bytes.len();
    let mut buf = vec![0u8; total];

    let header = FileHeader {
        magic: ro::MAGIC,
        version: ro::VERSION,
        flags: 0,
        arch: ro::ARCH_X86_64,
        reserved: 0,
        sec_count: 1,
        sym_count: 1,
        strtab_size: strtab_bytes.len() as u64,
        entry_point: 0,
    };
    buf.pwrite_with(header, 0, scroll::LE).unwrap();

    let mut name_buf = [0u8; 8];
    name_buf[..5].copy_from_slice(b".text");
    let desc = SectionDescriptor {
        name: name_buf,
        align_log2: 0,
        flags: ro::SECTION_FLAG_READ | ro::SECTION_FLAG_EXEC,
        reserved: 0,
        file_offset: text_offset as u32,
        file_size: text_bytes.len() as u32,
        mem_size: text_bytes.len() as u32,
        reloc_count: 0,
        reloc_offset: 0,
    };
    buf.pwrite_with(desc, header_size, scroll::LE).unwrap();
    buf[text_offset..text_offset + text_bytes.len()].copy_from_slice(&text_bytes);

    let mut name24 = [0u8; 24];
    let main_name = fixed_name("main", 24);
    name24.copy_from_slice(&main_name);
    let sym = SymbolRecord {
        name: name24,
        value: 2,
        sec_idx: 1, // 1-based: section 0
        kind: ro::SYM_TYPE_FUNC,
        bind: ro::SYM_BIND_GLOBAL,
        reserved: 0,
    };
    buf.pwrite_with(sym, sym_offset, scroll::LE).unwrap();
    buf[strtab_offset..].copy_from_slice(&strtab_bytes);

    let ctx = Context::create(&test_job()).unwrap();
    let tu = ro::load(&ctx, "min.o".into(), &buf).unwrap();

    assert_eq!(tu.sections.len(), 1);
    assert_eq!(tu.sections[0].name, ".text");
    assert_eq!(tu.sections[0].data, text_bytes);
    assert_eq!(tu.sections[0].mem_size, 4);
    assert!(tu.sections[0].flags.exec);
    assert!(tu.sections[0].flags.read);
    assert!(!tu.sections[0].flags.write);

    assert_eq!(tu.symbols.len(), 1);
    assert_eq!(tu.symbols[0].name, "main");
    assert_eq!(tu.symbols[0].value, 2);
    assert_eq!(tu.symbols[0].section_index, Some(0));
    assert_eq!(tu.symbols[0].binding, ro::Binding::Global);
    assert_eq!(tu.symbols[0].kind, ro::SymbolType::Func);

    assert!(tu.relocations.is_empty());
    assert_eq!(tu.entry_offset, None);
}

#[test]
fn bss_section_is_materialized_zeroed() {
    let header_size = FileHeader::size_with(&scroll::LE);
    let desc_size = SectionDescriptor::size_with(&scroll::LE);
    let strtab_offset = header_size + desc_size;
    let strtab_bytes = [0u8];
    let total = strtab_offset + strtab_bytes.len();
    let mut buf = vec![0u8; total];

    let header = FileHeader {
        magic: ro::MAGIC,
        version: ro::VERSION,
        flags: 0,
        arch: ro::ARCH_X86_64,
        reserved: 0,
        sec_count: 1,
        sym_count: 0,
        strtab_size: 1,
        entry_point: 0,
    };
    buf.pwrite_with(header, 0, scroll::LE).unwrap();

    let mut name_buf = [0u8; 8];
    name_buf[..4].copy_from_slice(b".bss");
    let desc = SectionDescriptor {
        name: name_buf,
        align_log2: 3,
        flags: ro::SECTION_FLAG_READ | ro::SECTION_FLAG_WRITE | ro::SECTION_FLAG_BSS,
        reserved: 0,
        file_offset: 0,
        file_size: 0,
        mem_size: 16,
        reloc_count: 0,
        reloc_offset: 0,
    };
    buf.pwrite_with(desc, header_size, scroll::LE).unwrap();

    let ctx = Context::create(&test_job()).unwrap();
    let tu = ro::load(&ctx, "bss.o".into(), &buf).unwrap();

    assert_eq!(tu.sections[0].data.len(), 16);
    assert!(tu.sections[0].data.iter().all(|&b| b == 0));
}
