//! The Symbol Resolver (C5): merges symbols across translation units and
//! archive members into a single [`ResolutionPlan`], pulling archive members
//! on demand and classifying unresolved globals as imports or hard errors.

use crate::archive::Archive;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::job::Job;
use crate::ro::{Binding, RelocationKind, Section, TranslationUnit};
use crate::search;
use indexmap::IndexMap;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanSectionId(pub usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanSymbolId(pub usize);
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImportId(pub usize);

#[derive(Debug, Clone, Copy)]
pub enum Location {
    Section { section: PlanSectionId, offset: u64 },
    Import(ImportId),
    Unresolved,
}

#[derive(Debug, Clone)]
pub struct PlanSymbol {
    pub name: String,
    pub location: Location,
    pub binding: Binding,
}

#[derive(Debug, Clone)]
pub struct PlanRelocation {
    pub section: PlanSectionId,
    pub offset: u64,
    pub kind: RelocationKind,
    pub symbol: PlanSymbolId,
    pub addend: i32,
}

#[derive(Debug, Clone)]
pub struct ImportBinding {
    pub module: String,
    pub symbol: String,
    pub slot: u32,
}

#[derive(Debug, Clone)]
pub struct ExportBinding {
    pub name: String,
    pub symbol: PlanSymbolId,
    pub ordinal: u32,
}

/// Output of resolution: everything the PE/ELF emitters need, referring to
/// translation units and sections by small `Copy` index types rather than
/// raw references.
pub struct ResolutionPlan {
    tus: Vec<TranslationUnit>,
    sections_index: Vec<(usize, usize)>,
    pub symbols: Vec<PlanSymbol>,
    pub relocations: Vec<PlanRelocation>,
    pub imports: Vec<ImportBinding>,
    pub exports: Vec<ExportBinding>,
    pub entry: Option<(PlanSectionId, u64)>,
}

impl ResolutionPlan {
    pub fn section(&self, id: PlanSectionId) -> &Section {
        let (tu, local) = self.sections_index[id.0];
        &self.tus[tu].sections[local]
    }

    pub fn section_count(&self) -> usize {
        self.sections_index.len()
    }

    pub fn section_ids(&self) -> impl Iterator<Item = PlanSectionId> + '_ {
        (0..self.sections_index.len()).map(PlanSectionId)
    }

    /// Mutable access to a section's byte buffer, for relocation patching.
    pub fn section_data_mut(&mut self, id: PlanSectionId) -> &mut Vec<u8> {
        let (tu, local) = self.sections_index[id.0];
        &mut self.tus[tu].sections[local].data
    }
}

#[derive(Debug, Clone, Copy)]
enum MergeEntry {
    Defined {
        tu: usize,
        sym: usize,
        strong: bool,
    },
    Pending {
        requires_resolution: bool,
    },
}

pub fn resolve(ctx: &Context, initial_tus: Vec<TranslationUnit>, job: &Job) -> Result<ResolutionPlan> {
    let mut all_tus = initial_tus;
    let mut merged: IndexMap<String, MergeEntry> = IndexMap::new();

    for tu_idx in 0..all_tus.len() {
        merge_tu(ctx, &mut merged, &all_tus, tu_idx)?;
    }

    let mut pulled: HashSet<(String, String)> = HashSet::new();
    loop {
        let pending = pending_names(&merged, &job.config.imports);
        if pending.is_empty() {
            break;
        }
        let mut progress = false;
        for libname in &job.config.libraries {
            let path = search::find_library(libname, &job.config.library_paths)?;
            let bytes = fs::read(&path)?;
            let archive = Archive::parse(&bytes)?;
            let path_label = path.to_string_lossy().to_string();
            for i in 0..archive.count() {
                let member_name = archive.name(i).unwrap_or("").to_string();
                let key = (path_label.clone(), member_name.clone());
                if pulled.contains(&key) {
                    continue;
                }
                let provided = match archive.defined_globals(ctx, i) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if provided.iter().any(|g| pending.contains(g)) {
                    debug!("pulling archive member `{}` from `{}`", member_name, path_label);
                    let tu = archive.extract(ctx, i)?;
                    let tu_idx = all_tus.len();
                    all_tus.push(tu);
                    merge_tu(ctx, &mut merged, &all_tus, tu_idx)?;
                    pulled.insert(key);
                    progress = true;
                }
            }
        }
        if !progress {
            break;
        }
    }

    // Import classification (step 3).
    let final_pending = pending_names(&merged, &[]);
    let mut imports = Vec::new();
    let mut import_for: HashMap<String, ImportId> = HashMap::new();
    let mut unresolved = Vec::new();
    for name in &final_pending {
        if let Some(entry) = job.config.imports.iter().find(|e| &e.symbol == name) {
            let slot = entry
                .slot
                .unwrap_or_else(|| job.config.imports.iter().position(|e| e.symbol == entry.symbol).unwrap() as u32);
            let id = ImportId(imports.len());
            imports.push(ImportBinding {
                module: entry.module.clone(),
                symbol: entry.symbol.clone(),
                slot,
            });
            import_for.insert(name.clone(), id);
        } else {
            unresolved.push(name.clone());
        }
    }
    if !unresolved.is_empty() {
        unresolved.sort();
        return Err(Error::UnresolvedSymbol(unresolved));
    }

    // Flatten sections across all (final) TUs.
    let mut sections_index = Vec::new();
    let mut section_map: HashMap<(usize, usize), PlanSectionId> = HashMap::new();
    for (tu_idx, tu) in all_tus.iter().enumerate() {
        for local_idx in 0..tu.sections.len() {
            let id = PlanSectionId(sections_index.len());
            section_map.insert((tu_idx, local_idx), id);
            sections_index.push((tu_idx, local_idx));
        }
    }

    // Build the merged (cross-TU) symbol array in insertion order.
    let mut plan_symbols = Vec::with_capacity(merged.len());
    let mut name_to_plan: HashMap<String, PlanSymbolId> = HashMap::new();
    for (name, entry) in merged.iter() {
        let (location, binding) = match *entry {
            MergeEntry::Defined { tu, sym, strong } => {
                let symbol = &all_tus[tu].symbols[sym];
                let local_section = symbol
                    .section_index
                    .expect("a Defined merge entry always carries a section");
                let location = Location::Section {
                    section: section_map[&(tu, local_section)],
                    offset: symbol.value,
                };
                let binding = if strong { Binding::Global } else { Binding::Weak };
                (location, binding)
            }
            MergeEntry::Pending { .. } => {
                let location = match import_for.get(name) {
                    Some(id) => Location::Import(*id),
                    None => Location::Unresolved,
                };
                (location, Binding::Global)
            }
        };
        let id = PlanSymbolId(plan_symbols.len());
        plan_symbols.push(PlanSymbol {
            name: name.clone(),
            location,
            binding,
        });
        name_to_plan.insert(name.clone(), id);
    }

    // Append per-TU local symbols, each with its own plan id.
    let mut local_ids: HashMap<(usize, usize), PlanSymbolId> = HashMap::new();
    for (tu_idx, tu) in all_tus.iter().enumerate() {
        for (sym_idx, symbol) in tu.symbols.iter().enumerate() {
            if symbol.binding != Binding::Local {
                continue;
            }
            let location = match symbol.section_index {
                Some(local_section) => Location::Section {
                    section: section_map[&(tu_idx, local_section)],
                    offset: symbol.value,
                },
                None => Location::Unresolved,
            };
            let id = PlanSymbolId(plan_symbols.len());
            plan_symbols.push(PlanSymbol {
                name: symbol.name.clone(),
                location,
                binding: Binding::Local,
            });
            local_ids.insert((tu_idx, sym_idx), id);
        }
    }

    // Relocation rewriting (step 4).
    let mut plan_relocations = Vec::new();
    for (tu_idx, tu) in all_tus.iter().enumerate() {
        for reloc in &tu.relocations {
            let symbol = &tu.symbols[reloc.symbol_index as usize];
            let plan_symbol = if symbol.binding == Binding::Local {
                local_ids[&(tu_idx, reloc.symbol_index as usize)]
            } else {
                *name_to_plan
                    .get(&symbol.name)
                    .expect("resolver invariant: every non-local symbol name is in the merged table")
            };
            plan_relocations.push(PlanRelocation {
                section: section_map[&(tu_idx, reloc.section_index)],
                offset: reloc.offset,
                kind: reloc.kind,
                symbol: plan_symbol,
                addend: reloc.addend,
            });
        }
    }

    // Entry resolution (step 5).
    let entry = resolve_entry(job, &name_to_plan, &plan_symbols, &all_tus, &section_map);

    // Export collection (step 6).
    let mut exports = Vec::new();
    let mut ordinal = 1u32;
    for name in &job.config.exports {
        match name_to_plan.get(name) {
            Some(&symbol) => {
                exports.push(ExportBinding {
                    name: name.clone(),
                    symbol,
                    ordinal,
                });
                ordinal += 1;
            }
            None => warn!("export `{}` not found in merged symbol table", name),
        }
    }

    Ok(ResolutionPlan {
        tus: all_tus,
        sections_index,
        symbols: plan_symbols,
        relocations: plan_relocations,
        imports,
        exports,
        entry,
    })
}

fn merge_tu(
    ctx: &Context,
    merged: &mut IndexMap<String, MergeEntry>,
    all_tus: &[TranslationUnit],
    tu_idx: usize,
) -> Result<()> {
    let tu = &all_tus[tu_idx];
    for (sym_idx, symbol) in tu.symbols.iter().enumerate() {
        if symbol.binding == Binding::Local {
            continue;
        }
        // Canonicalize through the interner so two symbols with equal
        // content always merge under the identical key (Testable Property 2),
        // rather than relying on `String`'s own `Eq`/`Hash` impl alone.
        let name = ctx.resolve(ctx.intern(&symbol.name));
        let is_defined = symbol.section_index.is_some();
        if is_defined {
            let strong = symbol.binding == Binding::Global;
            match merged.get(&name).copied() {
                None => {
                    merged.insert(
                        name,
                        MergeEntry::Defined {
                            tu: tu_idx,
                            sym: sym_idx,
                            strong,
                        },
                    );
                }
                Some(MergeEntry::Defined {
                    tu: existing_tu,
                    strong: existing_strong,
                    ..
                }) => {
                    if existing_strong && strong {
                        return Err(Error::MultipleDefinition {
                            name,
                            first: all_tus[existing_tu].path.clone(),
                            second: tu.path.clone(),
                        });
                    }
                    if !existing_strong && strong {
                        merged.insert(
                            name,
                            MergeEntry::Defined {
                                tu: tu_idx,
                                sym: sym_idx,
                                strong,
                            },
                        );
                    }
                    // existing strong, new weak: existing wins, nothing to do.
                    // existing weak, new weak: first weak wins, nothing to do.
                }
                Some(MergeEntry::Pending { .. }) => {
                    merged.insert(
                        name,
                        MergeEntry::Defined {
                            tu: tu_idx,
                            sym: sym_idx,
                            strong,
                        },
                    );
                }
            }
        } else {
            let requires = symbol.binding == Binding::Global;
            match merged.get_mut(&name) {
                None => {
                    merged.insert(name, MergeEntry::Pending { requires_resolution: requires });
                }
                Some(MergeEntry::Pending { requires_resolution }) => {
                    *requires_resolution |= requires;
                }
                Some(MergeEntry::Defined { .. }) => {
                    // already resolved elsewhere; this reference is satisfied.
                }
            }
        }
    }
    Ok(())
}

fn pending_names(merged: &IndexMap<String, MergeEntry>, exclude_imports: &[crate::job::ImportEntry]) -> HashSet<String> {
    merged
        .iter()
        .filter_map(|(name, entry)| match entry {
            MergeEntry::Pending { requires_resolution: true } => {
                if exclude_imports.iter().any(|e| &e.symbol == name) {
                    None
                } else {
                    Some(name.clone())
                }
            }
            _ => None,
        })
        .collect()
}

fn resolve_entry(
    job: &Job,
    name_to_plan: &HashMap<String, PlanSymbolId>,
    plan_symbols: &[PlanSymbol],
    all_tus: &[TranslationUnit],
    section_map: &HashMap<(usize, usize), PlanSectionId>,
) -> Option<(PlanSectionId, u64)> {
    let candidates: Vec<&str> = if let Some(name) = &job.config.entry_point {
        vec![name.as_str()]
    } else {
        vec!["main", "_start", "WinMain", "wmain"]
    };

    for candidate in candidates {
        if let Some(&id) = name_to_plan.get(candidate) {
            if let Location::Section { section, offset } = plan_symbols[id.0].location {
                return Some((section, offset));
            }
        }
    }

    if job.config.entry_point.is_none() {
        if let Some(first) = all_tus.first() {
            if let Some(offset) = first.entry_offset {
                if let Some(&section) = section_map.get(&(0, crate::ro::SECTION_TEXT)) {
                    return Some((section, offset));
                }
            }
        }
    }

    warn!("no entry point could be resolved; output may not be runnable");
    None
}
