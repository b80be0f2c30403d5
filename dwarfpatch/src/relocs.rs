//! Relocation bookkeeping for debug sections of relocatable objects.
//!
//! In an unlinked object, a 32-bit DWARF offset may live in the addend of an
//! ELF relocation instead of the section bytes. Reading the literal word then
//! yields garbage, and writing it back would be silently undone at link time.
//! [`RelocIndex`] mediates both directions: a read resolves the value through
//! the covering relocation, and the immediately following write stores the
//! new value wherever the old one actually lived.

use gimli::Endianity;

use crate::error::{EditError, EditErrorKind};
use crate::Endian;

/// Debug sections whose section-relative offsets are referenced through
/// relocations that the editor must maintain.
pub const TRACKED_TARGETS: &[&str] = &[
    ".debug_str",
    ".debug_str_offsets",
    ".debug_line",
    ".debug_line_str",
    ".debug_macro",
    ".debug_abbrev",
];

/// Returns the 32-bit absolute relocation type for an ELF machine.
pub fn abs32_reloc_type(machine: u16) -> Option<u32> {
    use goblin::elf::header::*;

    // Not yet in goblin's header constants.
    const EM_LOONGARCH: u16 = 258;

    Some(match machine {
        EM_386 => 1,                                      // R_386_32
        EM_X86_64 => 10,                                  // R_X86_64_32
        EM_ARM => 2,                                      // R_ARM_ABS32
        EM_AARCH64 => 258,                                // R_AARCH64_ABS32
        EM_PPC | EM_PPC64 => 1,                           // R_PPC(64)_ADDR32
        EM_S390 => 4,                                     // R_390_32
        EM_RISCV => 1,                                    // R_RISCV_32
        EM_MIPS | EM_MIPS_RS3_LE => 2,                    // R_MIPS_32
        EM_SPARC | EM_SPARC32PLUS | EM_SPARCV9 => 3,      // R_SPARC_32
        EM_LOONGARCH => 1,                                // R_LARCH_32
        _ => return None,
    })
}

/// One relocation of the underlying relocation section, in original order.
#[derive(Clone, Debug)]
pub struct RawReloc {
    pub offset: u64,
    pub sym: usize,
    pub rtype: u32,
    /// RELA addend; unused for REL.
    pub addend: i64,
}

/// A relocation that covers a DWARF offset the editor may rewrite.
#[derive(Clone, Debug)]
struct Tracked {
    offset: u64,
    /// Index into [`RelocIndex::entries`].
    raw: usize,
    /// Effective addend: symbol value plus the RELA addend.
    addend: i64,
    sym_value: u64,
}

/// Sorted relocation lookup for one debug section.
#[derive(Debug)]
pub struct RelocIndex {
    /// Section index of the REL/RELA section itself.
    pub shndx: usize,
    pub is_rela: bool,
    entries: Vec<RawReloc>,
    tracked: Vec<Tracked>,
    /// Set when an addend or offset changed and the relocation section has
    /// to be written back.
    pub dirty: bool,
    last_read: Option<usize>,
}

impl RelocIndex {
    /// Builds the index from parsed relocations.
    ///
    /// `tracked_syms` maps a symbol index to its value for symbols that
    /// resolve into one of [`TRACKED_TARGETS`]; relocations against other
    /// symbols are carried through verbatim. Tracked relocations must use
    /// the architecture's 32-bit absolute type.
    pub fn new(
        shndx: usize,
        is_rela: bool,
        entries: Vec<RawReloc>,
        tracked_syms: impl Fn(usize) -> Option<u64>,
        abs32_type: Option<u32>,
    ) -> Result<Self, EditError> {
        let mut tracked = Vec::new();
        for (raw, entry) in entries.iter().enumerate() {
            let sym_value = match tracked_syms(entry.sym) {
                Some(value) => value,
                None => continue,
            };
            if Some(entry.rtype) != abs32_type {
                return Err(EditErrorKind::BadRelocationType(entry.rtype).into());
            }
            let addend = if is_rela {
                sym_value as i64 + entry.addend
            } else {
                sym_value as i64
            };
            tracked.push(Tracked {
                offset: entry.offset,
                raw,
                addend,
                sym_value,
            });
        }
        tracked.sort_by_key(|t| t.offset);

        Ok(RelocIndex {
            shndx,
            is_rela,
            entries,
            tracked,
            dirty: false,
            last_read: None,
        })
    }

    fn tracked_at(&self, pos: usize) -> Option<usize> {
        self.tracked
            .binary_search_by_key(&(pos as u64), |t| t.offset)
            .ok()
    }

    /// Reads the 32-bit word at `pos`, resolving a covering relocation.
    ///
    /// Records `pos` so the paired [`RelocIndex::write_u32`] can commit to
    /// the same site.
    pub fn read_u32(&mut self, data: &[u8], pos: usize, endian: Endian) -> u32 {
        let word = endian.read_u32(&data[pos..pos + 4]);
        self.last_read = Some(pos);
        match self.tracked_at(pos) {
            Some(index) => {
                let tracked = &self.tracked[index];
                if self.is_rela {
                    tracked.addend as u32
                } else {
                    word.wrapping_add(tracked.addend as u32)
                }
            }
            None => word,
        }
    }

    /// Writes `value` at the site of the immediately preceding read.
    ///
    /// Returns `true` if the stored bytes or addend actually changed.
    pub fn write_u32(&mut self, data: &mut [u8], pos: usize, value: u32, endian: Endian) -> bool {
        debug_assert_eq!(
            self.last_read,
            Some(pos),
            "relocated write without a paired read"
        );
        self.last_read = None;

        match self.tracked_at(pos) {
            Some(index) => {
                let tracked = &mut self.tracked[index];
                if self.is_rela {
                    let addend = value as i64 - tracked.sym_value as i64;
                    let raw = &mut self.entries[tracked.raw];
                    if raw.addend == addend {
                        return false;
                    }
                    raw.addend = addend;
                    tracked.addend = tracked.sym_value as i64 + addend;
                    self.dirty = true;
                    true
                } else {
                    let literal = value.wrapping_sub(tracked.addend as u32);
                    let old = endian.read_u32(&data[pos..pos + 4]);
                    if old == literal {
                        return false;
                    }
                    endian.write_u32(&mut data[pos..pos + 4], literal);
                    true
                }
            }
            None => {
                let old = endian.read_u32(&data[pos..pos + 4]);
                if old == value {
                    return false;
                }
                endian.write_u32(&mut data[pos..pos + 4], value);
                true
            }
        }
    }

    /// Rewrites every `r_offset` through `map`, marking the section dirty if
    /// any moved. Used when `.debug_line` tables change size.
    pub fn shift_offsets(&mut self, map: impl Fn(u64) -> u64) {
        let mut moved = false;
        for entry in &mut self.entries {
            let mapped = map(entry.offset);
            if mapped != entry.offset {
                entry.offset = mapped;
                moved = true;
            }
        }
        if moved {
            for tracked in &mut self.tracked {
                tracked.offset = self.entries[tracked.raw].offset;
            }
            self.tracked.sort_by_key(|t| t.offset);
            self.dirty = true;
        }
    }

    /// Serializes the relocation section back into bytes, preserving the
    /// original entry order.
    pub fn serialize(&self, is_64: bool, endian: Endian) -> Vec<u8> {
        let entsize = match (is_64, self.is_rela) {
            (true, true) => 24,
            (true, false) => 16,
            (false, true) => 12,
            (false, false) => 8,
        };
        let mut out = vec![0u8; entsize * self.entries.len()];
        for (index, entry) in self.entries.iter().enumerate() {
            let at = index * entsize;
            if is_64 {
                let info = ((entry.sym as u64) << 32) | u64::from(entry.rtype);
                endian.write_u64(&mut out[at..at + 8], entry.offset);
                endian.write_u64(&mut out[at + 8..at + 16], info);
                if self.is_rela {
                    endian.write_u64(&mut out[at + 16..at + 24], entry.addend as u64);
                }
            } else {
                let info = ((entry.sym as u32) << 8) | (entry.rtype & 0xff);
                endian.write_u32(&mut out[at..at + 4], entry.offset as u32);
                endian.write_u32(&mut out[at + 4..at + 8], info);
                if self.is_rela {
                    endian.write_u32(&mut out[at + 8..at + 12], entry.addend as u32);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::RunTimeEndian;

    const LE: Endian = RunTimeEndian::Little;

    fn index(is_rela: bool, entries: Vec<RawReloc>) -> RelocIndex {
        // Symbol 1 is a tracked section symbol with value 0.
        RelocIndex::new(3, is_rela, entries, |sym| (sym == 1).then_some(0), Some(10)).unwrap()
    }

    #[test]
    fn test_rela_read_write() {
        let mut data = vec![0u8; 8];
        let mut relocs = index(
            true,
            vec![RawReloc {
                offset: 4,
                sym: 1,
                rtype: 10,
                addend: 0x60,
            }],
        );

        assert_eq!(relocs.read_u32(&data, 4, LE), 0x60);
        assert!(relocs.write_u32(&mut data, 4, 0x42, LE));
        assert!(relocs.dirty);
        // The literal word stays zero; the addend carries the value.
        assert_eq!(&data[4..8], &[0, 0, 0, 0]);
        assert_eq!(relocs.read_u32(&data, 4, LE), 0x42);
    }

    #[test]
    fn test_rel_read_write() {
        let mut data = vec![0u8; 4];
        data[0] = 0x60;
        let mut relocs = index(
            false,
            vec![RawReloc {
                offset: 0,
                sym: 1,
                rtype: 10,
                addend: 0,
            }],
        );

        assert_eq!(relocs.read_u32(&data, 0, LE), 0x60);
        assert!(relocs.write_u32(&mut data, 0, 0x42, LE));
        assert_eq!(&data[0..4], &[0x42, 0, 0, 0]);
        // REL edits land in section bytes, not in the relocation section.
        assert!(!relocs.dirty);
    }

    #[test]
    fn test_unrelocated_site() {
        let mut data = vec![0u8; 4];
        data[0] = 7;
        let mut relocs = index(true, Vec::new());

        assert_eq!(relocs.read_u32(&data, 0, LE), 7);
        assert!(!relocs.write_u32(&mut data, 0, 7, LE));
        assert_eq!(relocs.read_u32(&data, 0, LE), 7);
        assert!(relocs.write_u32(&mut data, 0, 9, LE));
        assert_eq!(data[0], 9);
    }

    #[test]
    fn test_untracked_symbol_type_ignored() {
        // Relocations against untracked symbols may use any type.
        let relocs = RelocIndex::new(
            3,
            true,
            vec![RawReloc {
                offset: 0,
                sym: 2,
                rtype: 1,
                addend: 0,
            }],
            |_| None,
            Some(10),
        );
        assert!(relocs.is_ok());
    }

    #[test]
    fn test_bad_type_is_fatal() {
        let relocs = RelocIndex::new(
            3,
            true,
            vec![RawReloc {
                offset: 0,
                sym: 1,
                rtype: 1,
                addend: 0,
            }],
            |sym| (sym == 1).then_some(0),
            Some(10),
        );
        assert!(relocs.is_err());
    }

    #[test]
    fn test_shift_offsets() {
        let mut relocs = index(
            true,
            vec![
                RawReloc {
                    offset: 8,
                    sym: 1,
                    rtype: 10,
                    addend: 0,
                },
                RawReloc {
                    offset: 16,
                    sym: 2,
                    rtype: 99,
                    addend: 0,
                },
            ],
        );
        relocs.shift_offsets(|off| off + 6);
        assert!(relocs.dirty);

        let bytes = relocs.serialize(true, LE);
        assert_eq!(LE.read_u64(&bytes[0..8]), 14);
        assert_eq!(LE.read_u64(&bytes[24..32]), 22);
    }

    #[test]
    fn test_serialize_roundtrip_32bit() {
        let relocs = index(
            true,
            vec![RawReloc {
                offset: 4,
                sym: 1,
                rtype: 10,
                addend: 0x42,
            }],
        );
        let bytes = relocs.serialize(false, LE);
        assert_eq!(bytes.len(), 12);
        assert_eq!(LE.read_u32(&bytes[0..4]), 4);
        assert_eq!(LE.read_u32(&bytes[4..8]), (1 << 8) | 10);
        assert_eq!(LE.read_u32(&bytes[8..12]), 0x42);
    }
}
