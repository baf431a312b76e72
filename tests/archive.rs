//! A hand-built minimal `ar` archive wrapping one RO object, exercising
//! `Archive::parse`/`count`/`name`/`extract`/`defined_globals`.

use ferrolink::archive::Archive;
use ferrolink::context::Context;
use ferrolink::job::{InputSource, Job, JobConfig, OutputKind, Target};
use ferrolink::ro::{self, FileHeader, SectionDescriptor, SymbolRecord};
use scroll::{Pwrite, SizeWith};

fn test_job() -> Job {
    Job {
        target: Target::Elf,
        output_kind: OutputKind::Executable,
        output_path: std::path::PathBuf::from("/tmp/ferrolink-archive-test"),
        inputs: vec![InputSource::Memory {
            label: "unused".into(),
            bytes: vec![],
        }],
        config: JobConfig::default(),
    }
}

/// Build a minimal RO object blob: one `.text` section and one Global
/// symbol `helper` defined in it.
fn build_ro_object() -> Vec<u8> {
    let header_size = FileHeader::size_with(&scroll::LE);
    let desc_size = SectionDescriptor::size_with(&scroll::LE);
    let sym_size = SymbolRecord::size_with(&scroll::LE);

    let text_offset = header_size + desc_size;
    let text_bytes = [0x90u8, 0xC3];
    let sym_offset = text_offset + text_bytes.len();
    let strtab_offset = sym_offset + sym_size;
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
    name24[..6].copy_from_slice(b"helper");
    let sym = SymbolRecord {
        name: name24,
        value: 0,
        sec_idx: 1,
        kind: ro::SYM_TYPE_FUNC,
        bind: ro::SYM_BIND_GLOBAL,
        reserved: 0,
    };
    buf.pwrite_with(sym, sym_offset, scroll::LE).unwrap();
    buf[strtab_offset..].copy_from_slice(&strtab_bytes);
    buf
}

fn pad_field(value: &str, width: usize) -> Vec<u8> {
    let mut buf = vec![b' '; width];
    let bytes = value.as_bytes();
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

fn build_archive_with_one_member(name: &str, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(ferrolink::archive::MAGIC_ARCH);

    buf.extend_from_slice(&pad_field(name, 16));
    buf.extend_from_slice(&pad_field("0", 12)); // mtime
    buf.extend_from_slice(&pad_field("0", 6)); // uid
    buf.extend_from_slice(&pad_field("0", 6)); // gid
    buf.extend_from_slice(&pad_field("100644", 8)); // mode
    buf.extend_from_slice(&pad_field(&data.len().to_string(), 10)); // size
    buf.extend_from_slice(b"`\n"); // terminator

    buf.extend_from_slice(data);
    if data.len() % 2 == 1 {
        buf.push(b'\n'); // 2-byte member alignment pad
    }
    buf
}

#[test]
fn parses_a_single_member_archive_and_extracts_its_symbols() {
    let object = build_ro_object();
    let archive_bytes = build_archive_with_one_member("helper.o", &object);

    let archive = Archive::parse(&archive_bytes).unwrap();
    assert_eq!(archive.count(), 1);
    assert_eq!(archive.name(0), Some("helper.o"));

    let job = test_job();
    let ctx = Context::create(&job).unwrap();

    let tu = archive.extract(&ctx, 0).unwrap();
    assert_eq!(tu.symbols.len(), 1);
    assert_eq!(tu.symbols[0].name, "helper");

    let globals = archive.defined_globals(&ctx, 0).unwrap();
    assert_eq!(globals, vec!["helper".to_string()]);
}

#[test]
fn rejects_truncated_magic() {
    let err = Archive::parse(b"short").unwrap_err();
    assert!(matches!(err, ferrolink::Error::BadFormat(_)));
}
