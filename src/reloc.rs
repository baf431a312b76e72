//! Shared relocation arithmetic (C6), used by both the PE and ELF emitters
//! during their apply-relocations pass.

use crate::ro::RelocationKind;
use log::{trace, warn};

/// Resolves a plan symbol or import slot to a final virtual address, from
/// the emitter's point of view.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    /// `image_base + section_vaddr + symbol_value`.
    Address(u64),
    /// The relocation's target could not be resolved to an address (e.g. a
    /// weak symbol with no definition and no import slot). The site is left
    /// untouched and a warning logged.
    Unresolved,
}

/// Compute the patch bytes for one relocation and write them into `section`
/// at `offset`. `patch_site_va` is the final virtual address of the patch
/// site itself (`image_base + section_vaddr + offset`).
///
/// Returns `true` if the site was patched (used by the PE emitter to decide
/// whether to add a `.reloc` entry for ABS64 sites).
pub fn apply(
    section: &mut [u8],
    offset: usize,
    kind: RelocationKind,
    patch_site_va: u64,
    addend: i64,
    target: Target,
) -> bool {
    let width = match kind {
        RelocationKind::Abs64 => 8,
        RelocationKind::Pc32 | RelocationKind::GotPc32 | RelocationKind::Secrel32 => 4,
    };
    if offset.checked_add(width).map_or(true, |end| end > section.len()) {
        warn!(
            "relocation at offset {:#x} (width {}) overflows section of size {:#x}; skipped",
            offset,
            width,
            section.len()
        );
        return false;
    }

    let s = match target {
        Target::Address(addr) => addr,
        Target::Unresolved => {
            warn!("relocation at offset {:#x} targets an unresolved symbol; skipped", offset);
            return false;
        }
    };

    match kind {
        RelocationKind::Abs64 => {
            let value = s.wrapping_add(addend as u64);
            section[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
            trace!("ABS64 @ {:#x} <- {:#x}", offset, value);
        }
        RelocationKind::Pc32 | RelocationKind::GotPc32 => {
            let value = (s as i64 + addend) - (patch_site_va as i64 + 4);
            let value = value as i32;
            section[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            trace!("PC32/GOTPC32 @ {:#x} <- {:#x}", offset, value);
        }
        RelocationKind::Secrel32 => {
            let value = (s.wrapping_add(addend as u64)) as u32;
            section[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
            trace!("SECREL32 @ {:#x} <- {:#x}", offset, value);
        }
    }
    true
}
