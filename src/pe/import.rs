//! Builds the `.idata` section contents: Import Directory Table, Import
//! Lookup/Address Tables, hint-name table, and module name strings
//! (§4.7 step 2).

use crate::resolver::ImportBinding;
use indexmap::IndexMap;
use scroll::{Pwrite, SizeWith};
use std::collections::HashMap;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pwrite, SizeWith)]
pub struct ImportDirectoryEntry {
    pub import_lookup_table_rva: u32,
    pub time_date_stamp: u32,
    pub forwarder_chain: u32,
    pub name_rva: u32,
    pub import_address_table_rva: u32,
}

pub struct IdataLayout {
    pub bytes: Vec<u8>,
    pub import_directory_rva: u32,
    pub import_directory_size: u32,
    pub iat_rva: u32,
    pub iat_size: u32,
    /// `(module, symbol) -> RVA of that symbol's IAT entry`, used by the
    /// relocation pass to resolve import targets.
    pub iat_entry_rva: HashMap<(String, String), u32>,
}

/// Build the full `.idata` section for `imports`, assuming it will be
/// placed at virtual address `idata_rva`.
pub fn build(imports: &[ImportBinding], idata_rva: u32) -> IdataLayout {
    let mut by_module: IndexMap<&str, Vec<&ImportBinding>> = IndexMap::new();
    for import in imports {
        by_module.entry(&import.module).or_default().push(import);
    }
    let n_modules = by_module.len();
    let entry_size = ImportDirectoryEntry::size_with(&scroll::LE) as u32;

    let directory_rva = idata_rva;
    let directory_size = (n_modules as u32 + 1) * entry_size;

    let ilt_rva = directory_rva + directory_size;
    let module_table_size: Vec<u32> = by_module
        .values()
        .map(|syms| (syms.len() as u32 + 1) * 8)
        .collect();
    let total_table_size: u32 = module_table_size.iter().sum();

    let iat_rva = ilt_rva + total_table_size;
    let hintname_rva = iat_rva + total_table_size;

    let mut hint_entry_rva = Vec::new();
    let mut cursor = hintname_rva;
    for syms in by_module.values() {
        for sym in syms {
            hint_entry_rva.push(cursor);
            let entry_len = 2 + sym.symbol.len() + 1;
            cursor += (entry_len + entry_len % 2) as u32;
        }
    }

    let names_rva = cursor;
    let mut module_name_rva = Vec::with_capacity(n_modules);
    let mut name_cursor = names_rva;
    for module in by_module.keys() {
        module_name_rva.push(name_cursor);
        name_cursor += module.len() as u32 + 1;
    }

    let total_size = (name_cursor - idata_rva) as usize;
    let mut bytes = vec![0u8; total_size];
    let rva_off = |rva: u32| (rva - idata_rva) as usize;

    // Per-module ILT/IAT base RVAs.
    let mut module_table_rva = Vec::with_capacity(n_modules);
    let mut table_cursor = 0u32;
    for size in &module_table_size {
        module_table_rva.push(table_cursor);
        table_cursor += size;
    }

    // (a) import directory table (terminator entry left zero-filled).
    for i in 0..n_modules {
        let entry = ImportDirectoryEntry {
            import_lookup_table_rva: ilt_rva + module_table_rva[i],
            time_date_stamp: 0,
            forwarder_chain: 0,
            name_rva: module_name_rva[i],
            import_address_table_rva: iat_rva + module_table_rva[i],
        };
        bytes
            .pwrite_with(entry, rva_off(directory_rva) + i * entry_size as usize, scroll::LE)
            .expect("idata buffer sized for directory table");
    }

    // (b) ILT and (c) IAT — identical bit patterns (both hold the hint-name
    // RVA until the loader resolves the IAT in place).
    let mut iat_entry_rva = HashMap::new();
    for table_base in [ilt_rva, iat_rva] {
        let mut idx = 0usize;
        for (module_idx, syms) in by_module.values().enumerate() {
            let mut entry_off = rva_off(table_base) + module_table_rva[module_idx] as usize;
            for sym in syms {
                let hint_rva = hint_entry_rva[idx];
                bytes
                    .pwrite_with::<u64>(hint_rva as u64, entry_off, scroll::LE)
                    .expect("idata buffer sized for ILT/IAT");
                if table_base == iat_rva {
                    iat_entry_rva.insert((sym.module.clone(), sym.symbol.clone()), table_base + (entry_off - rva_off(table_base)) as u32);
                }
                entry_off += 8;
                idx += 1;
            }
            // 8-byte zero terminator already present from the zero fill.
        }
    }

    // (d) hint-name table
    let mut idx = 0usize;
    for syms in by_module.values() {
        for sym in syms {
            let off = rva_off(hint_entry_rva[idx]);
            bytes.pwrite_with::<u16>(0, off, scroll::LE).unwrap();
            let name_bytes = sym.symbol.as_bytes();
            bytes[off + 2..off + 2 + name_bytes.len()].copy_from_slice(name_bytes);
            idx += 1;
        }
    }

    // (e) module name strings
    for (i, module) in by_module.keys().enumerate() {
        let off = rva_off(module_name_rva[i]);
        let name_bytes = module.as_bytes();
        bytes[off..off + name_bytes.len()].copy_from_slice(name_bytes);
    }

    IdataLayout {
        bytes,
        import_directory_rva: directory_rva,
        import_directory_size: directory_size,
        iat_rva,
        iat_size: total_table_size,
        iat_entry_rva,
    }
}
