//! Testable Property 5 (PE structural invariants) and scenario S2 (a
//! `kernel32.dll` import resolving through a patched PC32 relocation).

use ferrolink::context::Context;
use ferrolink::job::{ImportEntry, InputSource, Job, JobConfig, OutputKind, Target};
use ferrolink::pe;
use ferrolink::resolver;
use ferrolink::ro::{
    Binding, Relocation, RelocationKind, Section, SectionFlags, SectionKind, Symbol, SymbolType,
    TranslationUnit, Visibility,
};
use scroll::Pread;

fn test_job(tmp_name: &str, config: JobConfig) -> Job {
    Job {
        target: Target::Pe,
        output_kind: OutputKind::Executable,
        output_path: std::env::temp_dir().join(tmp_name),
        inputs: vec![InputSource::Memory {
            label: "unused".into(),
            bytes: vec![],
        }],
        config,
    }
}

fn code_section(bytes: Vec<u8>) -> Section {
    let len = bytes.len() as u32;
    Section {
        name: ".text".into(),
        kind: SectionKind::Code,
        flags: SectionFlags {
            read: true,
            write: false,
            exec: true,
        },
        align: 16,
        data: bytes,
        mem_size: len,
    }
}

#[test]
fn emits_a_structurally_valid_pe_image() {
    let job = test_job("ferrolink-pe-basic.exe", JobConfig::default());
    let ctx = Context::create(&job).unwrap();

    let tu = TranslationUnit {
        path: "a.o".into(),
        sections: vec![code_section(vec![0xC3])], // ret
        symbols: vec![Symbol {
            name: "main".into(),
            section_index: Some(0),
            value: 0,
            size: 0,
            binding: Binding::Global,
            visibility: Visibility::Default,
            kind: SymbolType::Func,
        }],
        relocations: vec![],
        entry_offset: None,
    };

    let mut plan = resolver::resolve(&ctx, vec![tu], &job).unwrap();
    pe::emit(&ctx, &job, &mut plan).unwrap();

    let bytes = std::fs::read(&job.output_path).unwrap();
    let dos_magic: u16 = bytes.pread_with(0, scroll::LE).unwrap();
    assert_eq!(dos_magic, 0x5a4d); // "MZ"

    let pe_pointer: u32 = bytes.pread_with(0x3c, scroll::LE).unwrap();
    let pe_sig: u32 = bytes.pread_with(pe_pointer as usize, scroll::LE).unwrap();
    assert_eq!(pe_sig, 0x0000_4550); // "PE\0\0"

    let coff_off = pe_pointer as usize + 4;
    let number_of_sections: u16 = bytes.pread_with(coff_off + 2, scroll::LE).unwrap();
    assert!(number_of_sections >= 1);

    let opt_off = coff_off + 20; // sizeof(CoffHeader)
    let size_of_headers: u32 = bytes.pread_with(opt_off + 60, scroll::LE).unwrap();
    let file_alignment: u32 = bytes.pread_with(opt_off + 36, scroll::LE).unwrap();
    assert_eq!(file_alignment, 0x200);
    assert_eq!(size_of_headers % file_alignment, 0);

    let entry_point: u32 = bytes.pread_with(opt_off + 16, scroll::LE).unwrap();
    assert!(entry_point > 0, "main should have resolved as the entry point");

    std::fs::remove_file(&job.output_path).ok();
}

#[test]
fn kernel32_import_patches_pc32_and_populates_import_directory() {
    let mut config = JobConfig::default();
    config.imports.push(ImportEntry {
        module: "kernel32.dll".into(),
        symbol: "ExitProcess".into(),
        slot: None,
    });

    let job = test_job("ferrolink-pe-import.exe", config);
    let ctx = Context::create(&job).unwrap();

    // `call [rip+disp32]` style placeholder: the 4 bytes at offset 2 are the
    // PC32 displacement field the resolver patches in.
    let mut text = vec![0x00u8; 8];
    let tu = TranslationUnit {
        path: "a.o".into(),
        sections: vec![code_section(std::mem::take(&mut text))],
        symbols: vec![Symbol {
            name: "ExitProcess".into(),
            section_index: None,
            value: 0,
            size: 0,
            binding: Binding::Global,
            visibility: Visibility::Default,
            kind: SymbolType::NoType,
        }],
        relocations: vec![Relocation {
            section_index: 0,
            offset: 2,
            kind: RelocationKind::Pc32,
            symbol_index: 0,
            // An import target carries no addend term (S2); this nonzero
            // value exercises that the emitter ignores it rather than
            // folding it into the patched bytes.
            addend: -4,
        }],
        entry_offset: Some(0),
    };

    let mut plan = resolver::resolve(&ctx, vec![tu], &job).unwrap();
    assert_eq!(plan.imports.len(), 1);
    pe::emit(&ctx, &job, &mut plan).unwrap();

    let bytes = std::fs::read(&job.output_path).unwrap();
    let pe_pointer: u32 = bytes.pread_with(0x3c, scroll::LE).unwrap();
    let opt_off = pe_pointer as usize + 4 + 20;

    let data_directory_off = opt_off + 112; // sizeof(OptionalHeader64) before data_directory
    let import_dir_off = data_directory_off + (1 * 8); // data_directory[1] == Import
    let import_size: u32 = bytes.pread_with(import_dir_off + 4, scroll::LE).unwrap();
    assert_eq!(import_size, 40); // one module entry (20 bytes) + null terminator (20 bytes)

    let iat_dir_off = data_directory_off + (12 * 8); // data_directory[12] == IAT
    let iat_rva: u32 = bytes.pread_with(iat_dir_off, scroll::LE).unwrap();
    assert!(iat_rva > 0);

    // sizeof(OptionalHeader64) == 240 (112 bytes of scalar fields + 16 * 8
    // bytes of data directories); section headers follow immediately.
    let section_headers_off = opt_off + 240;
    let text_vaddr: u32 = bytes.pread_with(section_headers_off + 12, scroll::LE).unwrap();
    let text_raw_offset: u32 = bytes.pread_with(section_headers_off + 20, scroll::LE).unwrap();

    let patch_site_rva = text_vaddr + 2;
    let patched: i32 = bytes
        .pread_with((text_raw_offset + 2) as usize, scroll::LE)
        .unwrap();
    let expected = iat_rva as i64 - (patch_site_rva as i64 + 4);
    assert_eq!(patched as i64, expected, "import relocation must not fold the addend in");

    std::fs::remove_file(&job.output_path).ok();
}
