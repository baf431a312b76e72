//! End-to-end coverage of `ferrolink::link`, the crate's sole public entry
//! point: scenario S1 (a minimal PE executable) and the on-failure
//! partial-output-removal behavior.

use ferrolink::job::{InputSource, Job, JobConfig, OutputKind, Target};
use ferrolink::ro::{self, FileHeader, SectionDescriptor, SymbolRecord};
use scroll::{Pwrite, SizeWith};

fn fixed_name(name: &str, width: usize) -> Vec<u8> {
    let mut buf = vec![0u8; width];
    let bytes = name.as_bytes();
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

/// One `.text` section with a single symbol, `sym_name`, bound and defined
/// (if `defined`) or left as an undefined reference otherwise.
fn build_ro_object(sym_name: &str, defined: bool) -> Vec<u8> {
    let header_size = FileHeader::size_with(&scroll::LE);
    let desc_size = SectionDescriptor::size_with(&scroll::LE);
    let sym_size = SymbolRecord::size_with(&scroll::LE);

    let text_offset = header_size + desc_size;
    let text_bytes = [0xC3u8]; // ret
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
    let name_bytes = fixed_name(sym_name, 24);
    name24.copy_from_slice(&name_bytes);
    let sym = SymbolRecord {
        name: name24,
        value: 0,
        sec_idx: if defined { 1 } else { 0 },
        kind: ro::SYM_TYPE_FUNC,
        bind: ro::SYM_BIND_GLOBAL,
        reserved: 0,
    };
    buf.pwrite_with(sym, sym_offset, scroll::LE).unwrap();
    buf[strtab_offset..].copy_from_slice(&strtab_bytes);
    buf
}

#[test]
fn link_produces_a_minimal_pe_executable() {
    let output_path = std::env::temp_dir().join("ferrolink-e2e-s1.exe");
    std::fs::remove_file(&output_path).ok();

    let job = Job {
        target: Target::Pe,
        output_kind: OutputKind::Executable,
        output_path: output_path.clone(),
        inputs: vec![InputSource::Memory {
            label: "a.o".into(),
            bytes: build_ro_object("main", true),
        }],
        config: JobConfig::default(),
    };

    ferrolink::link(job).unwrap();

    let bytes = std::fs::read(&output_path).unwrap();
    assert_eq!(&bytes[0..2], b"MZ");

    std::fs::remove_file(&output_path).ok();
}

#[test]
fn link_removes_partial_output_on_failure() {
    let output_path = std::env::temp_dir().join("ferrolink-e2e-failure.exe");
    std::fs::write(&output_path, b"stale output from a previous run").unwrap();
    assert!(output_path.exists());

    let job = Job {
        target: Target::Pe,
        output_kind: OutputKind::Executable,
        output_path: output_path.clone(),
        inputs: vec![InputSource::Memory {
            label: "a.o".into(),
            // An undefined Global reference with no import declared and no
            // archive to pull it from is an unconditional link failure.
            bytes: build_ro_object("needed_but_missing", false),
        }],
        config: JobConfig::default(),
    };

    let err = ferrolink::link(job).unwrap_err();
    assert!(matches!(err, ferrolink::Error::UnresolvedSymbol(_)));
    assert!(!output_path.exists(), "partial output must be removed on failure");
}
