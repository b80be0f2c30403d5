//! GNU build-id recomputation.
//!
//! The note descriptor is replaced with a canonical XXH3-128 digest over the
//! file's semantic contents: a normalized ELF header, the program headers,
//! and every section header plus its bytes. File offsets are zeroed out of
//! the hashed view so that layout-only differences do not change the id,
//! and all header fields are hashed in a fixed 64-bit little-endian shape
//! so the digest is independent of the host and of the file's own class and
//! byte order.

use goblin::elf::note::NT_GNU_BUILD_ID;
use goblin::elf::section_header::{SHT_NOBITS, SHT_NOTE};
use goblin::elf::{ProgramHeader, SectionHeader};
use xxhash_rust::xxh3::Xxh3;

use crate::elf::ElfFile;
use crate::error::{EditError, EditErrorKind};

/// Location of the build-id note descriptor within its section.
#[derive(Clone, Copy, Debug)]
pub struct BuildIdNote {
    /// Section index of the containing note section.
    pub shndx: usize,
    /// Byte offset of the descriptor within the section.
    pub desc_offset: usize,
    /// Size of the descriptor in bytes.
    pub desc_size: usize,
}

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// Finds the first `NT_GNU_BUILD_ID` note in an allocated note section.
pub fn find_build_id(file: &ElfFile) -> Result<Option<BuildIdNote>, EditError> {
    use gimli::Endianity;
    let endian = file.endian();

    for (shndx, shdr) in file.section_headers.iter().enumerate() {
        if shdr.sh_type != SHT_NOTE || !file.is_alloc(shndx) {
            continue;
        }
        let data = file.raw_section_data(shndx)?;
        let mut pos = 0;
        while pos + 12 <= data.len() {
            let namesz = endian.read_u32(&data[pos..pos + 4]) as usize;
            let descsz = endian.read_u32(&data[pos + 4..pos + 8]) as usize;
            let ntype = endian.read_u32(&data[pos + 8..pos + 12]);

            let name_start = pos + 12;
            let desc_start = align4(name_start + namesz);
            let desc_end = desc_start + descsz;
            if desc_end > data.len() {
                break;
            }

            if ntype == NT_GNU_BUILD_ID
                && namesz == 4
                && &data[name_start..name_start + 4] == b"GNU\0"
            {
                return Ok(Some(BuildIdNote {
                    shndx,
                    desc_offset: desc_start,
                    desc_size: descsz,
                }));
            }
            pos = align4(desc_end);
        }
    }
    Ok(None)
}

/// The current descriptor bytes of the note.
pub fn note_desc<'f>(file: &'f ElfFile, note: &BuildIdNote) -> Result<&'f [u8], EditError> {
    let data = file.raw_section_data(note.shndx)?;
    data.get(note.desc_offset..note.desc_offset + note.desc_size)
        .ok_or_else(|| EditErrorKind::MalformedElf.into())
}

fn canonical_ehdr(file: &ElfFile) -> [u8; 64] {
    let header = &file.header;
    let mut out = [0u8; 64];
    out[0..16].copy_from_slice(&header.e_ident);
    out[16..18].copy_from_slice(&header.e_type.to_le_bytes());
    out[18..20].copy_from_slice(&header.e_machine.to_le_bytes());
    out[20..24].copy_from_slice(&header.e_version.to_le_bytes());
    out[24..32].copy_from_slice(&header.e_entry.to_le_bytes());
    // e_phoff and e_shoff are layout, not content: hashed as zero.
    out[48..52].copy_from_slice(&header.e_flags.to_le_bytes());
    out[52..54].copy_from_slice(&header.e_ehsize.to_le_bytes());
    out[54..56].copy_from_slice(&header.e_phentsize.to_le_bytes());
    out[56..58].copy_from_slice(&header.e_phnum.to_le_bytes());
    out[58..60].copy_from_slice(&header.e_shentsize.to_le_bytes());
    out[60..62].copy_from_slice(&header.e_shnum.to_le_bytes());
    out[62..64].copy_from_slice(&header.e_shstrndx.to_le_bytes());
    out
}

fn canonical_phdr(phdr: &ProgramHeader) -> [u8; 56] {
    let mut out = [0u8; 56];
    out[0..4].copy_from_slice(&phdr.p_type.to_le_bytes());
    out[4..8].copy_from_slice(&phdr.p_flags.to_le_bytes());
    out[8..16].copy_from_slice(&phdr.p_offset.to_le_bytes());
    out[16..24].copy_from_slice(&phdr.p_vaddr.to_le_bytes());
    out[24..32].copy_from_slice(&phdr.p_paddr.to_le_bytes());
    out[32..40].copy_from_slice(&phdr.p_filesz.to_le_bytes());
    out[40..48].copy_from_slice(&phdr.p_memsz.to_le_bytes());
    out[48..56].copy_from_slice(&phdr.p_align.to_le_bytes());
    out
}

fn canonical_shdr(shdr: &SectionHeader) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[0..4].copy_from_slice(&(shdr.sh_name as u32).to_le_bytes());
    out[4..8].copy_from_slice(&shdr.sh_type.to_le_bytes());
    out[8..16].copy_from_slice(&shdr.sh_flags.to_le_bytes());
    out[16..24].copy_from_slice(&shdr.sh_addr.to_le_bytes());
    // sh_offset is layout: hashed as zero.
    out[32..40].copy_from_slice(&shdr.sh_size.to_le_bytes());
    out[40..44].copy_from_slice(&shdr.sh_link.to_le_bytes());
    out[44..48].copy_from_slice(&shdr.sh_info.to_le_bytes());
    out[48..56].copy_from_slice(&shdr.sh_addralign.to_le_bytes());
    out[56..64].copy_from_slice(&shdr.sh_entsize.to_le_bytes());
    out
}

/// Computes the new descriptor bytes for the note.
///
/// The first `min(n, 16)` descriptor bytes are hashed as zero, which makes
/// the operation idempotent for a given seed; descriptor bytes beyond the
/// digest size contribute as extra entropy and are preserved. The 128-bit
/// result is written in canonical big-endian order, truncated or zero-padded
/// to the descriptor size.
pub fn recompute(
    file: &ElfFile,
    note: &BuildIdNote,
    seed: Option<&[u8]>,
) -> Result<Vec<u8>, EditError> {
    let mut hasher = Xxh3::new();
    if let Some(seed) = seed {
        hasher.update(seed);
    }

    hasher.update(&canonical_ehdr(file));
    for phdr in &file.program_headers {
        hasher.update(&canonical_phdr(phdr));
    }
    for (shndx, shdr) in file.section_headers.iter().enumerate() {
        hasher.update(&canonical_shdr(shdr));
        if shdr.sh_type == SHT_NOBITS {
            continue;
        }
        let data = file.raw_section_data(shndx)?;
        if shndx == note.shndx {
            let mut masked = data.to_vec();
            let zeroed = note.desc_size.min(16);
            masked[note.desc_offset..note.desc_offset + zeroed].fill(0);
            hasher.update(&masked);
        } else {
            hasher.update(data);
        }
    }

    let canonical = hasher.digest128().to_be_bytes();
    let mut desc = vec![0u8; note.desc_size];
    let copied = note.desc_size.min(16);
    desc[..copied].copy_from_slice(&canonical[..copied]);
    if note.desc_size > 16 {
        // Preserve trailing descriptor bytes beyond the digest.
        let old = note_desc(file, note)?;
        desc[16..].copy_from_slice(&old[16..]);
    }
    Ok(desc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align4() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(4), 4);
        assert_eq!(align4(5), 8);
    }

    #[test]
    fn test_seed_sensitivity() {
        let mut a = Xxh3::new();
        a.update(b"abc");
        a.update(b"payload");
        let mut b = Xxh3::new();
        b.update(b"xyz");
        b.update(b"payload");
        assert_ne!(a.digest128(), b.digest128());
    }
}
