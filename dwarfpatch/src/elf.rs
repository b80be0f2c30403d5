//! ELF container access for the debug-info editor.
//!
//! Wraps goblin's ELF parsing into an owned [`ElfFile`] that can hand out
//! section bytes, transparently decompress and recompress debug sections,
//! build relocation indexes, and serialize the file back out under the layout
//! discipline the editor requires: allocated sections never move, unallocated
//! sections are repacked behind them, and the section header table follows.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use flate2::write::ZlibEncoder;
use flate2::{Decompress, FlushDecompress};
use gimli::Endianity;
use goblin::container::Ctx;
use goblin::elf;
use goblin::elf::compression_header::{CompressionHeader, ELFCOMPRESS_ZLIB};
use goblin::elf::section_header::{SHT_NOBITS, SHT_REL, SHT_RELA};
use goblin::elf::{ProgramHeader, SectionHeader};
use goblin::strtab::Strtab;

use crate::error::{EditError, EditErrorKind};
use crate::relocs::{RawReloc, RelocIndex, abs32_reloc_type, TRACKED_TARGETS};
use crate::Endian;

const SHF_ALLOC: u64 = elf::section_header::SHF_ALLOC as u64;
const SHF_COMPRESSED: u64 = elf::section_header::SHF_COMPRESSED as u64;

/// The debug sections the editor recognizes by name.
pub const DEBUG_SECTIONS: &[&str] = &[
    ".debug_info",
    ".debug_abbrev",
    ".debug_line",
    ".debug_aranges",
    ".debug_pubnames",
    ".debug_pubtypes",
    ".debug_macinfo",
    ".debug_loc",
    ".debug_str",
    ".debug_frame",
    ".debug_ranges",
    ".debug_types",
    ".debug_macro",
    ".debug_gdb_scripts",
    ".debug_rnglists",
    ".debug_line_str",
    ".debug_addr",
    ".debug_str_offsets",
    ".debug_loclists",
];

/// Maps a section name onto the canonical debug section name it carries.
///
/// Recognizes both plain `.debug_*` names and the legacy `.zdebug_*`
/// convention for compressed sections.
pub fn recognize_debug_section(name: &str) -> Option<&'static str> {
    DEBUG_SECTIONS
        .iter()
        .find(|&&canonical| {
            name == canonical
                || name
                    .strip_prefix(".z")
                    .is_some_and(|rest| rest == &canonical[1..])
        })
        .copied()
}

/// The compression applied to a section's bytes on disk.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    /// `SHF_COMPRESSED` with an ELF compression header.
    Chdr { align: u64 },
    /// Legacy GNU `.zdebug_*` style: a `ZLIB` magic and a big-endian size.
    Gnu,
}

/// One materialized debug section, decompressed and paired with its
/// relocation index.
#[derive(Debug)]
pub struct DebugSection {
    /// Canonical section name (`.zdebug_*` aliases are normalized).
    pub name: &'static str,
    /// Index of the section header in the file.
    pub shndx: usize,
    /// Decompressed section bytes; mutated in place by the rewrite pass.
    pub data: Vec<u8>,
    /// The compression to reapply on write, if the input was compressed.
    pub compression: Option<Compression>,
    /// Relocations applied to this section, if any.
    pub(crate) relocs: Option<RelocIndex>,
    /// Set when the section bytes or relocations were actually changed.
    pub dirty: bool,
}

impl DebugSection {
    fn check_word(&self, pos: usize) -> Result<(), EditError> {
        if pos + 4 > self.data.len() {
            return Err(EditErrorKind::MalformedDwarf(self.name, pos).into());
        }
        Ok(())
    }

    /// Reads the 32-bit word at `pos`, resolving a covering relocation.
    pub fn read_u32_rel(&mut self, pos: usize, endian: Endian) -> Result<u32, EditError> {
        self.check_word(pos)?;
        Ok(match &mut self.relocs {
            Some(relocs) => relocs.read_u32(&self.data, pos, endian),
            None => endian.read_u32(&self.data[pos..pos + 4]),
        })
    }

    /// Writes `value` at `pos` through the relocation protocol.
    ///
    /// Must immediately follow a [`DebugSection::read_u32_rel`] of the same
    /// position. Marks the section dirty only when bytes actually change.
    pub fn write_u32_rel(
        &mut self,
        pos: usize,
        value: u32,
        endian: Endian,
    ) -> Result<(), EditError> {
        self.check_word(pos)?;
        let changed = match &mut self.relocs {
            Some(relocs) => relocs.write_u32(&mut self.data, pos, value, endian),
            None => {
                let old = endian.read_u32(&self.data[pos..pos + 4]);
                if old != value {
                    endian.write_u32(&mut self.data[pos..pos + 4], value);
                }
                old != value
            }
        };
        if changed {
            self.dirty = true;
        }
        Ok(())
    }
}

/// An ELF file opened for editing.
pub struct ElfFile {
    data: Vec<u8>,
    /// The parsed ELF header.
    pub header: elf::Header,
    /// The program header table, empty for relocatable objects.
    pub program_headers: Vec<ProgramHeader>,
    /// The section header table.
    pub section_headers: Vec<SectionHeader>,
    section_names: Vec<String>,
    ctx: Ctx,
    endian: Endian,
}

impl ElfFile {
    /// Reads and parses the file at `path`.
    pub fn open(path: &Path) -> Result<Self, EditError> {
        let data = fs::read(path).map_err(|e| EditError::io("open input file", e))?;
        Self::parse(data)
    }

    /// Parses an ELF file from owned bytes.
    pub fn parse(data: Vec<u8>) -> Result<Self, EditError> {
        let header = elf::Elf::parse_header(&data)
            .map_err(|e| EditError::new(EditErrorKind::MalformedElf, e))?;

        let container = header
            .container()
            .map_err(|e| EditError::new(EditErrorKind::MalformedElf, e))?;
        let le = header
            .endianness()
            .map_err(|e| EditError::new(EditErrorKind::MalformedElf, e))?;
        let ctx = Ctx::new(container, le);

        let program_headers = ProgramHeader::parse(
            &data,
            header.e_phoff as usize,
            header.e_phnum as usize,
            ctx,
        )
        .map_err(|e| EditError::new(EditErrorKind::MalformedElf, e))?;

        let section_headers = SectionHeader::parse(
            &data,
            header.e_shoff as usize,
            header.e_shnum as usize,
            ctx,
        )
        .map_err(|e| EditError::new(EditErrorKind::MalformedElf, e))?;

        let shstrtab = section_headers
            .get(header.e_shstrndx as usize)
            .map(|shdr| Strtab::parse(&data, shdr.sh_offset as usize, shdr.sh_size as usize, 0x0))
            .transpose()
            .map_err(|e| EditError::new(EditErrorKind::MalformedElf, e))?
            .unwrap_or_default();

        let section_names = section_headers
            .iter()
            .map(|shdr| shstrtab.get_at(shdr.sh_name).unwrap_or_default().to_string())
            .collect();

        let endian = if le == scroll::Endian::Little {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        Ok(ElfFile {
            data,
            header,
            program_headers,
            section_headers,
            section_names,
            ctx,
            endian,
        })
    }

    /// The raw bytes the file was parsed from.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the file is a 64-bit ELF.
    pub fn is_64(&self) -> bool {
        self.ctx.container.is_big()
    }

    /// The byte order of the file.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The machine field of the ELF header.
    pub fn machine(&self) -> u16 {
        self.header.e_machine
    }

    /// The name of the section at `index`.
    pub fn section_name(&self, index: usize) -> &str {
        self.section_names.get(index).map_or("", String::as_str)
    }

    /// Whether the section at `index` occupies memory at runtime.
    pub fn is_alloc(&self, index: usize) -> bool {
        self.section_headers
            .get(index)
            .is_some_and(|shdr| shdr.sh_flags & SHF_ALLOC != 0)
    }

    /// The raw on-disk bytes of the section at `index`.
    pub fn raw_section_data(&self, index: usize) -> Result<&[u8], EditError> {
        let shdr = &self.section_headers[index];
        if shdr.sh_type == SHT_NOBITS {
            return Ok(&[]);
        }
        let offset = shdr.sh_offset as usize;
        let end = offset
            .checked_add(shdr.sh_size as usize)
            .ok_or(EditErrorKind::MalformedElf)?;
        self.data
            .get(offset..end)
            .ok_or_else(|| EditErrorKind::MalformedElf.into())
    }

    /// Reads the section at `index`, transparently removing compression.
    ///
    /// Returns the decompressed bytes and the compression to reapply on
    /// write, if any.
    pub fn load_section(&self, index: usize) -> Result<(Vec<u8>, Option<Compression>), EditError> {
        let shdr = &self.section_headers[index];
        let raw = self.raw_section_data(index)?;

        if shdr.sh_flags & SHF_COMPRESSED != 0 {
            let chdr = CompressionHeader::parse(raw, 0, self.ctx)
                .map_err(|e| EditError::new(EditErrorKind::MalformedElf, e))?;
            if chdr.ch_type != ELFCOMPRESS_ZLIB {
                return Err(EditErrorKind::UnsupportedCompression.into());
            }
            let compressed = &raw[CompressionHeader::size(self.ctx)..];
            let data = self.inflate(compressed, chdr.ch_size)?;
            return Ok((
                data,
                Some(Compression::Chdr {
                    align: chdr.ch_addralign,
                }),
            ));
        }

        if self.section_name(index).starts_with(".zdebug") {
            // 4 byte "ZLIB" magic, 8 byte big-endian uncompressed size.
            if raw.len() < 12 || &raw[..4] != b"ZLIB" {
                return Err(EditErrorKind::MalformedElf.into());
            }
            let mut size_bytes = [0u8; 8];
            size_bytes.copy_from_slice(&raw[4..12]);
            let data = self.inflate(&raw[12..], u64::from_be_bytes(size_bytes))?;
            return Ok((data, Some(Compression::Gnu)));
        }

        Ok((raw.to_vec(), None))
    }

    fn inflate(&self, compressed: &[u8], size: u64) -> Result<Vec<u8>, EditError> {
        let mut decompressed = Vec::with_capacity(size as usize);
        Decompress::new(true)
            .decompress_vec(compressed, &mut decompressed, FlushDecompress::Finish)
            .map_err(|e| EditError::new(EditErrorKind::MalformedElf, e))?;
        Ok(decompressed)
    }

    /// Reapplies the recorded compression to rewritten section bytes.
    pub fn compress_section(
        &self,
        data: &[u8],
        compression: Compression,
    ) -> Result<Vec<u8>, EditError> {
        let mut deflated = match compression {
            Compression::Chdr { align } => {
                let mut out = vec![0u8; CompressionHeader::size(self.ctx)];
                if self.is_64() {
                    self.endian.write_u32(&mut out[0..4], ELFCOMPRESS_ZLIB);
                    self.endian.write_u64(&mut out[8..16], data.len() as u64);
                    self.endian.write_u64(&mut out[16..24], align);
                } else {
                    self.endian.write_u32(&mut out[0..4], ELFCOMPRESS_ZLIB);
                    self.endian.write_u32(&mut out[4..8], data.len() as u32);
                    self.endian.write_u32(&mut out[8..12], align as u32);
                }
                out
            }
            Compression::Gnu => {
                let mut out = Vec::with_capacity(data.len() / 2 + 12);
                out.extend_from_slice(b"ZLIB");
                out.extend_from_slice(&(data.len() as u64).to_be_bytes());
                out
            }
        };

        let mut encoder = ZlibEncoder::new(&mut deflated, flate2::Compression::default());
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish().map(|_| ()))
            .map_err(|e| EditError::io("compress debug section", e))?;
        Ok(deflated)
    }

    /// Materializes a debug section together with its relocation index.
    pub fn load_debug_section(&self, index: usize) -> Result<DebugSection, EditError> {
        let name = recognize_debug_section(self.section_name(index))
            .unwrap_or(".debug_unknown");
        let (data, compression) = self.load_section(index)?;
        let relocs = self.build_reloc_index(index)?;
        Ok(DebugSection {
            name,
            shndx: index,
            data,
            compression,
            relocs,
            dirty: false,
        })
    }

    /// Builds the relocation index for the section at `target`, if a
    /// relocation section exists for it.
    pub(crate) fn build_reloc_index(&self, target: usize) -> Result<Option<RelocIndex>, EditError> {
        let reloc_shndx = match self.section_headers.iter().position(|shdr| {
            (shdr.sh_type == SHT_REL || shdr.sh_type == SHT_RELA)
                && shdr.sh_info as usize == target
        }) {
            Some(index) => index,
            None => return Ok(None),
        };
        let reloc_shdr = &self.section_headers[reloc_shndx];
        let is_rela = reloc_shdr.sh_type == SHT_RELA;

        let relocs = elf::RelocSection::parse(
            &self.data,
            reloc_shdr.sh_offset as usize,
            reloc_shdr.sh_size as usize,
            is_rela,
            self.ctx,
        )
        .map_err(|e| EditError::new(EditErrorKind::MalformedElf, e))?;

        let entries: Vec<RawReloc> = relocs
            .iter()
            .map(|r| RawReloc {
                offset: r.r_offset,
                sym: r.r_sym,
                rtype: r.r_type,
                addend: r.r_addend.unwrap_or(0),
            })
            .collect();

        // Resolve which symbols point into a tracked debug section.
        let symtab_shndx = reloc_shdr.sh_link as usize;
        let symtab_shdr = self
            .section_headers
            .get(symtab_shndx)
            .ok_or(EditErrorKind::MalformedElf)?;
        let count = if symtab_shdr.sh_entsize == 0 {
            0
        } else {
            (symtab_shdr.sh_size / symtab_shdr.sh_entsize) as usize
        };
        let symtab = elf::Symtab::parse(
            &self.data,
            symtab_shdr.sh_offset as usize,
            count,
            self.ctx,
        )
        .map_err(|e| EditError::new(EditErrorKind::MalformedElf, e))?;

        let mut tracked_values: Vec<Option<u64>> = Vec::with_capacity(symtab.len());
        for sym in symtab.iter() {
            let name = self.section_name(sym.st_shndx);
            let tracked = TRACKED_TARGETS
                .iter()
                .any(|&target_name| recognize_debug_section(name) == Some(target_name));
            tracked_values.push(tracked.then_some(sym.st_value));
        }

        let index = RelocIndex::new(
            reloc_shndx,
            is_rela,
            entries,
            move |sym| tracked_values.get(sym).copied().flatten(),
            abs32_reloc_type(self.machine()),
        )?;
        Ok(Some(index))
    }

    /// Serializes the file with the given section replacements.
    ///
    /// Allocated sections keep their file offsets and bytes; replacements
    /// for them must not change size. Unallocated sections are packed after
    /// the highest allocated offset, each aligned per `sh_addralign`, and
    /// the section header table is placed last.
    pub fn write_file(&self, replacements: &HashMap<usize, Vec<u8>>) -> Result<Vec<u8>, EditError> {
        let is_64 = self.is_64();
        let ehsize = if is_64 { 64u64 } else { 52u64 };
        let shentsize = if is_64 { 64usize } else { 40usize };

        let mut out = self.data.clone();
        let mut shdrs = self.section_headers.clone();

        // Floor for repacking: past the ELF header, the program header
        // table and every allocated section's file contents.
        let mut pos = ehsize;
        if self.header.e_phnum > 0 {
            let phend = self.header.e_phoff
                + u64::from(self.header.e_phnum) * u64::from(self.header.e_phentsize);
            pos = pos.max(phend);
        }
        for (index, shdr) in shdrs.iter().enumerate().skip(1) {
            if shdr.sh_flags & SHF_ALLOC == 0 || shdr.sh_type == SHT_NOBITS {
                continue;
            }
            pos = pos.max(shdr.sh_offset + shdr.sh_size);
            if let Some(bytes) = replacements.get(&index) {
                if bytes.len() as u64 != shdr.sh_size {
                    return Err(EditErrorKind::MalformedElf.into());
                }
                let offset = shdr.sh_offset as usize;
                out.get_mut(offset..offset + bytes.len())
                    .ok_or(EditErrorKind::MalformedElf)?
                    .copy_from_slice(bytes);
            }
        }

        for index in 1..shdrs.len() {
            let shdr = &mut shdrs[index];
            if shdr.sh_flags & SHF_ALLOC != 0 {
                continue;
            }

            let align = shdr.sh_addralign.max(1);
            let aligned = pos
                .checked_add(align - 1)
                .ok_or(EditErrorKind::MalformedElf)?
                & !(align - 1);

            if shdr.sh_type == SHT_NOBITS {
                shdr.sh_offset = aligned;
                continue;
            }

            let original = self.raw_section_data(index)?;
            let bytes = replacements
                .get(&index)
                .map(Vec::as_slice)
                .unwrap_or(original);

            let start = aligned as usize;
            let end = start + bytes.len();
            if out.len() < end {
                out.resize(end, 0);
            }
            // Deterministic padding between sections.
            out[pos as usize..start].fill(0);
            out[start..end].copy_from_slice(bytes);

            shdr.sh_offset = aligned;
            shdr.sh_size = bytes.len() as u64;
            pos = end as u64;
        }

        // Section header table last.
        let shalign = if is_64 { 8u64 } else { 4u64 };
        let shoff = (pos + shalign - 1) & !(shalign - 1);
        let shend = shoff as usize + shentsize * shdrs.len();
        if out.len() < shend {
            out.resize(shend, 0);
        }
        out[pos as usize..shoff as usize].fill(0);
        for (index, shdr) in shdrs.iter().enumerate() {
            let at = shoff as usize + index * shentsize;
            self.write_section_header(&mut out[at..at + shentsize], shdr);
        }
        out.truncate(shend);

        // Only e_shoff changes in the ELF header.
        if is_64 {
            self.endian.write_u64(&mut out[40..48], shoff);
        } else {
            self.endian.write_u32(&mut out[32..36], shoff as u32);
        }

        Ok(out)
    }

    fn write_section_header(&self, out: &mut [u8], shdr: &SectionHeader) {
        let endian = self.endian;
        if self.is_64() {
            endian.write_u32(&mut out[0..4], shdr.sh_name as u32);
            endian.write_u32(&mut out[4..8], shdr.sh_type);
            endian.write_u64(&mut out[8..16], shdr.sh_flags);
            endian.write_u64(&mut out[16..24], shdr.sh_addr);
            endian.write_u64(&mut out[24..32], shdr.sh_offset);
            endian.write_u64(&mut out[32..40], shdr.sh_size);
            endian.write_u32(&mut out[40..44], shdr.sh_link);
            endian.write_u32(&mut out[44..48], shdr.sh_info);
            endian.write_u64(&mut out[48..56], shdr.sh_addralign);
            endian.write_u64(&mut out[56..64], shdr.sh_entsize);
        } else {
            endian.write_u32(&mut out[0..4], shdr.sh_name as u32);
            endian.write_u32(&mut out[4..8], shdr.sh_type);
            endian.write_u32(&mut out[8..12], shdr.sh_flags as u32);
            endian.write_u32(&mut out[12..16], shdr.sh_addr as u32);
            endian.write_u32(&mut out[16..20], shdr.sh_offset as u32);
            endian.write_u32(&mut out[20..24], shdr.sh_size as u32);
            endian.write_u32(&mut out[24..28], shdr.sh_link);
            endian.write_u32(&mut out[28..32], shdr.sh_info);
            endian.write_u32(&mut out[32..36], shdr.sh_addralign as u32);
            endian.write_u32(&mut out[36..40], shdr.sh_entsize as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognize_debug_section() {
        assert_eq!(recognize_debug_section(".debug_info"), Some(".debug_info"));
        assert_eq!(recognize_debug_section(".zdebug_info"), Some(".debug_info"));
        assert_eq!(
            recognize_debug_section(".debug_str_offsets"),
            Some(".debug_str_offsets")
        );
        assert_eq!(recognize_debug_section(".text"), None);
        assert_eq!(recognize_debug_section(".debug_infox"), None);
    }
}
