//! The `.debug_str_offsets` rewriter.
//!
//! Each entry of the index is a 32-bit offset into `.debug_str`. After the
//! pool is rebuilt the entries are rewritten one by one; entries pointing at
//! strings no attribute ever reached are redirected to the `"<debugedit>"`
//! sentinel so the index stays structurally valid. The section never
//! changes size.

use gimli::Endianity;

use crate::elf::DebugSection;
use crate::error::{EditError, EditErrorKind};
use crate::strings::StringPool;
use crate::Endian;

const SEC: &str = ".debug_str_offsets";

/// Rewrites every entry of every sub-unit against the finalized pool.
///
/// A no-op unless the `.debug_str` pool received replacements.
pub fn rewrite_str_offsets(
    sec: &mut DebugSection,
    strings: &StringPool,
    endian: Endian,
) -> Result<(), EditError> {
    if !strings.is_live() {
        return Ok(());
    }

    let len = sec.data.len();
    let mut pos = 0usize;
    while pos < len {
        // Sub-units are 8-byte aligned.
        pos = (pos + 7) & !7;
        if pos >= len {
            break;
        }
        if len - pos < 8 {
            if sec.data[pos..].iter().all(|&b| b == 0) {
                break;
            }
            return Err(EditErrorKind::MalformedDwarf(SEC, pos).into());
        }

        let unit_length = endian.read_u32(&sec.data[pos..pos + 4]);
        if unit_length == 0xffff_ffff {
            return Err(EditErrorKind::Dwarf64(SEC, pos).into());
        }
        let version = endian.read_u16(&sec.data[pos + 4..pos + 6]);
        if version != 5 {
            return Err(EditErrorKind::UnsupportedVersion(version).into());
        }
        let padding = endian.read_u16(&sec.data[pos + 6..pos + 8]);
        if padding != 0 {
            return Err(EditErrorKind::MalformedDwarf(SEC, pos + 6).into());
        }
        let end = pos + 4 + unit_length as usize;
        if end > len || unit_length < 4 {
            return Err(EditErrorKind::MalformedDwarf(SEC, pos).into());
        }

        let mut entry = pos + 8;
        while entry + 4 <= end {
            let old = sec.read_u32_rel(entry, endian)?;
            let new = match strings.lookup(old) {
                Some(new) => new,
                None => {
                    let sentinel = strings
                        .sentinel_offset()
                        .ok_or(EditErrorKind::MalformedDwarf(SEC, entry))?;
                    tracing::warn!(
                        offset = old,
                        "unreferenced string index entry redirected to sentinel"
                    );
                    sentinel
                }
            };
            sec.write_u32_rel(entry, new, endian)?;
            entry += 4;
        }
        pos = end;
    }
    Ok(())
}
