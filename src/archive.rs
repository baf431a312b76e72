//! Loader for `ar`-style archives (`!<arch>\n` / `!<thin>\n`).

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ro::{self, TranslationUnit};
use scroll::Pread;

pub const MAGIC_ARCH: &[u8; 8] = b"!<arch>\n";
pub const MAGIC_THIN: &[u8; 8] = b"!<thin>\n";

const MEMBER_HEADER_SIZE: usize = 60;

/// One member's name and byte range within the archive blob.
struct MemberRecord {
    name: String,
    offset: usize,
    size: usize,
}

pub struct Archive<'a> {
    bytes: &'a [u8],
    members: Vec<MemberRecord>,
}

impl<'a> Archive<'a> {
    /// Parse an archive's member directory. Special members (`/`, `//`,
    /// `__.SYMDEF`) are recognized and skipped.
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(Error::BadFormat("archive too short for magic".into()));
        }
        let magic: &[u8; 8] = bytes[..8].try_into().unwrap();
        if magic != MAGIC_ARCH && magic != MAGIC_THIN {
            return Err(Error::BadFormat("not an ar archive".into()));
        }

        let mut members = Vec::new();
        let mut pos = 8usize;
        while pos + MEMBER_HEADER_SIZE <= bytes.len() {
            let header = &bytes[pos..pos + MEMBER_HEADER_SIZE];
            let name_field = std::str::from_utf8(&header[0..16])
                .map_err(|_| Error::BadFormat("non-utf8 archive member name".into()))?
                .trim_end();
            let size_field = std::str::from_utf8(&header[48..58])
                .map_err(|_| Error::BadFormat("non-utf8 archive member size".into()))?
                .trim();
            let terminator = &header[58..60];
            if terminator != b"`\n" {
                return Err(Error::BadFormat(
                    "bad archive member header terminator".into(),
                ));
            }
            let size: usize = size_field
                .parse()
                .map_err(|_| Error::BadFormat("bad archive member size field".into()))?;

            let data_start = pos + MEMBER_HEADER_SIZE;
            let data_end = data_start
                .checked_add(size)
                .ok_or_else(|| Error::BadFormat("archive member size overflow".into()))?;
            if data_end > bytes.len() {
                return Err(Error::BadFormat(
                    "archive member extends past end of file".into(),
                ));
            }

            let name = name_field.trim_end_matches('/').to_string();
            let is_special =
                name_field == "/" || name_field == "//" || name.starts_with("__.SYMDEF");
            if !is_special {
                members.push(MemberRecord {
                    name,
                    offset: data_start,
                    size,
                });
            }

            // members are 2-byte aligned; a trailing pad byte follows odd sizes.
            pos = data_end + (size % 2);
        }

        Ok(Archive { bytes, members })
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.members.get(index).map(|m| m.name.as_str())
    }

    /// Load member `index` as a translation unit. Members that are not
    /// RO-shaped (bad magic) are reported as `Unsupported` — this core only
    /// needs RO members extracted from archives.
    pub fn extract(&self, ctx: &Context, index: usize) -> Result<TranslationUnit> {
        let member = self
            .members
            .get(index)
            .ok_or_else(|| Error::InvalidArgument(format!("no archive member {}", index)))?;
        let data = &self.bytes[member.offset..member.offset + member.size];
        if data.len() < 4 || data.pread_with::<u32>(0, scroll::LE).ok() != Some(ro::MAGIC) {
            return Err(Error::Unsupported(format!(
                "archive member `{}` is not an RO object",
                member.name
            )));
        }
        ro::load(ctx, member.name.clone(), data)
    }

    /// The set of Global-defined symbol names a member provides, without
    /// fully loading it — used by the resolver's archive-pulling loop to
    /// decide which members to extract.
    pub fn defined_globals(&self, ctx: &Context, index: usize) -> Result<Vec<String>> {
        let tu = self.extract(ctx, index)?;
        Ok(tu
            .symbols
            .iter()
            .filter(|s| {
                s.binding == crate::ro::Binding::Global && s.section_index.is_some()
            })
            .map(|s| s.name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_archive() {
        let err = Archive::parse(b"not an archive").unwrap_err();
        assert!(matches!(err, Error::BadFormat(_)));
    }
}
