//! Builds the `.reloc` (base relocation) section: one page block per
//! 4 KiB page containing an ABS64 site, each block 4-byte aligned (§4.6,
//! §4.7 step 2). Emits no trailing zero block (§9).

use scroll::{Pwrite, SizeWith};
use std::collections::BTreeMap;

pub const IMAGE_REL_BASED_ABSOLUTE: u16 = 0;
pub const IMAGE_REL_BASED_DIR64: u16 = 10;

#[repr(C)]
#[derive(Debug, PartialEq, Copy, Clone, Default, Pwrite, SizeWith)]
pub struct BaseRelocBlockHeader {
    pub page_rva: u32,
    pub block_size: u32,
}

/// Build the `.reloc` section bytes from the final RVAs of every ABS64
/// patch site.
pub fn build(abs64_site_rvas: &[u32]) -> Vec<u8> {
    let mut by_page: BTreeMap<u32, Vec<u16>> = BTreeMap::new();
    for &rva in abs64_site_rvas {
        let page = rva & !0xFFF;
        let low12 = (rva & 0xFFF) as u16;
        let type_offset = (IMAGE_REL_BASED_DIR64 << 12) | low12;
        by_page.entry(page).or_default().push(type_offset);
    }

    let mut bytes = Vec::new();
    for (page_rva, mut entries) in by_page {
        if entries.len() % 2 == 1 {
            entries.push(IMAGE_REL_BASED_ABSOLUTE << 12);
        }
        let block_size = 8 + entries.len() as u32 * 2;
        let mut off = bytes.len();
        bytes.resize(off + block_size as usize, 0);
        bytes
            .pwrite_with(
                BaseRelocBlockHeader { page_rva, block_size },
                off,
                scroll::LE,
            )
            .expect("buffer sized for block header");
        off += 8;
        for entry in entries {
            bytes.pwrite_with::<u16>(entry, off, scroll::LE).unwrap();
            off += 2;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_entry_block_is_four_byte_aligned() {
        let bytes = build(&[0x3042]);
        // header(8) + one entry(2) + one pad entry(2) == 12, matching S6.
        assert_eq!(bytes.len(), 12);
        assert_eq!(bytes.len() % 4, 0);
    }
}
