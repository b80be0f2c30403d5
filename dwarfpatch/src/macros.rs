//! The `.debug_macro` rewriter.
//!
//! Macro units embed 32-bit offsets into `.debug_str` and `.debug_line`.
//! Both are rewritten in place; the section itself never changes size.
//! Paths inside macro definition bodies are deliberately left alone.

use gimli::constants;

use crate::editor::PassEnv;
use crate::elf::DebugSection;
use crate::error::{EditError, EditErrorKind};
use crate::info::Unit;
use crate::line::LineTables;
use crate::reader::Reader;
use crate::relocs::RelocIndex;
use crate::strings::{PoolKind, StringPool};
use crate::Endian;

/// Bit 0: offsets are 64-bit. Bit 1: a `debug_line_offset` field follows.
const FLAG_OFFSET_SIZE: u8 = 0x01;
const FLAG_DEBUG_LINE_OFFSET: u8 = 0x02;

/// A byte position inside `.debug_macro` the rewrite pass revisits.
#[derive(Debug)]
pub enum MacroSite {
    /// A 32-bit `.debug_str` offset.
    Str { pos: usize },
    /// The `debug_line_offset` header field.
    LineOff { pos: usize },
}

fn read_u32_field(
    relocs: &mut Option<RelocIndex>,
    data: &[u8],
    pos: usize,
    endian: Endian,
) -> Result<u32, EditError> {
    use gimli::Endianity;
    if pos + 4 > data.len() {
        return Err(EditErrorKind::MalformedDwarf(".debug_macro", pos).into());
    }
    Ok(match relocs {
        Some(index) => index.read_u32(data, pos, endian),
        None => endian.read_u32(&data[pos..pos + 4]),
    })
}

/// Collection pass over one `.debug_macro` section.
///
/// Interns every referenced `.debug_str` entry and records the positions the
/// rewrite pass has to revisit. Units are correlated with their compilation
/// unit through the `DW_AT_macros` offset so that string indices can be
/// resolved.
pub fn collect_macros(
    sec: &mut DebugSection,
    units: &[Unit],
    env: &mut PassEnv<'_>,
) -> Result<Vec<MacroSite>, EditError> {
    let endian = env.endian;
    let DebugSection { data, relocs, .. } = sec;
    let data: &[u8] = data;

    let mut sites = Vec::new();
    let mut r = Reader::new(data, endian, ".debug_macro");

    while r.remaining() > 0 {
        let unit_start = r.pos();
        let version = r.read_u16()?;
        if version != 4 && version != 5 {
            return Err(EditErrorKind::UnsupportedVersion(version).into());
        }
        let flags = r.read_u8()?;
        if flags & FLAG_OFFSET_SIZE != 0 {
            return Err(EditErrorKind::Dwarf64(".debug_macro", unit_start).into());
        }
        if flags & !(FLAG_OFFSET_SIZE | FLAG_DEBUG_LINE_OFFSET) != 0 {
            return Err(EditErrorKind::MalformedDwarf(".debug_macro", unit_start).into());
        }

        let unit = units
            .iter()
            .find(|unit| unit.macros_offset == Some(unit_start as u32));

        if flags & FLAG_DEBUG_LINE_OFFSET != 0 {
            let pos = r.pos();
            read_u32_field(relocs, data, pos, endian)?;
            r.skip(4)?;
            sites.push(MacroSite::LineOff { pos });
        }

        loop {
            let opcode = r.read_u8()?;
            if opcode == 0 {
                break;
            }
            match constants::DwMacro(opcode) {
                constants::DW_MACRO_define | constants::DW_MACRO_undef => {
                    r.read_uleb128()?;
                    r.read_cstr()?;
                }
                constants::DW_MACRO_start_file => {
                    r.read_uleb128()?;
                    r.read_uleb128()?;
                }
                constants::DW_MACRO_end_file => {}
                constants::DW_MACRO_define_strp | constants::DW_MACRO_undef_strp => {
                    r.read_uleb128()?;
                    let pos = r.pos();
                    let offset = read_u32_field(relocs, data, pos, endian)?;
                    r.skip(4)?;
                    env.intern_str(PoolKind::Str, offset)?;
                    sites.push(MacroSite::Str { pos });
                }
                constants::DW_MACRO_import => {
                    // An offset into this same section; rewriting is
                    // length-preserving so the value stays valid.
                    r.skip(4)?;
                }
                constants::DW_MACRO_define_strx | constants::DW_MACRO_undef_strx => {
                    r.read_uleb128()?;
                    let index = r.read_uleb128()?;
                    match unit {
                        Some(unit) => {
                            let offset = env.resolve_strx(unit, index)?;
                            env.intern_str(PoolKind::Str, offset)?;
                        }
                        None => tracing::warn!(
                            offset = unit_start,
                            "macro unit is not referenced by any compilation unit; \
                             string index left unresolved"
                        ),
                    }
                }
                _ => return Err(EditErrorKind::UnknownMacroOpcode(opcode).into()),
            }
        }
    }

    Ok(sites)
}

/// Rewrite pass: revisits the recorded macro edit sites.
pub fn rewrite_macros(
    sec: &mut DebugSection,
    sites: &[MacroSite],
    strings: &StringPool,
    lines: &LineTables,
    endian: Endian,
) -> Result<(), EditError> {
    for site in sites {
        match *site {
            MacroSite::Str { pos } => {
                if !strings.is_live() {
                    continue;
                }
                let old = sec.read_u32_rel(pos, endian)?;
                match strings.lookup(old) {
                    Some(new) => sec.write_u32_rel(pos, new, endian)?,
                    None => tracing::warn!(
                        offset = old,
                        "macro string reference missing from the rewritten pool"
                    ),
                }
            }
            MacroSite::LineOff { pos } => {
                if !lines.moved() {
                    continue;
                }
                let old = sec.read_u32_rel(pos, endian)?;
                let new = lines.map_pos(u64::from(old)) as u32;
                sec.write_u32_rel(pos, new, endian)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::{Endianity, RunTimeEndian};

    const LE: Endian = RunTimeEndian::Little;

    fn section(name: &'static str, data: Vec<u8>) -> DebugSection {
        DebugSection {
            name,
            shndx: 0,
            data,
            compression: None,
            relocs: None,
            dirty: false,
        }
    }

    fn unit(macros_offset: Option<u32>) -> Unit {
        Unit {
            offset: 0,
            version: 5,
            address_size: 8,
            str_offsets_base: 8,
            macros_offset,
            stmt_list: None,
            comp_dir: Some(b"/tmp/build".to_vec()),
        }
    }

    fn env<'a>(
        strings: &'a mut StringPool,
        str_data: &'a [u8],
        str_offsets: Option<&'a mut DebugSection>,
    ) -> PassEnv<'a> {
        PassEnv {
            endian: LE,
            rewrite: true,
            base: Some(b"/tmp/build"),
            dest: Some(b"/usr"),
            strings,
            line_strings: None,
            str_data,
            line_str_data: &[],
            str_offsets,
            list: None,
        }
    }

    /// A version 2 line table with one directory and one file.
    fn build_line_table(dir: &[u8]) -> Vec<u8> {
        let header_body = [1u8, 1, 0xfb, 14, 1];
        let mut tables = Vec::new();
        tables.extend_from_slice(dir);
        tables.push(0);
        tables.push(0);
        tables.extend_from_slice(b"a.c\0");
        tables.extend_from_slice(&[1, 0, 0]);
        tables.push(0);
        let program = [0u8, 1, 1];

        let header_length = (header_body.len() + tables.len()) as u32;
        let unit_length = (2 + 4 + header_body.len() + tables.len() + program.len()) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(&unit_length.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&header_length.to_le_bytes());
        out.extend_from_slice(&header_body);
        out.extend_from_slice(&tables);
        out.extend_from_slice(&program);
        out
    }

    #[test]
    fn test_strp_rewrite_and_line_offset_remap() {
        // Two line tables; the first one shrinks, moving the second.
        let first = build_line_table(b"/tmp/build/x");
        let second = build_line_table(b"/opt/y");
        let second_off = first.len();
        let diff = first.len() - build_line_table(b"/usr/x").len();
        let mut line_data = first;
        line_data.extend_from_slice(&second);
        let mut line_sec = section(".debug_line", line_data);

        let str_data = b"/tmp/build\0GUARD 1\0";
        let mut strings = StringPool::new(PoolKind::Str);
        let mut lines = crate::line::LineTables::new();
        {
            let mut env = env(&mut strings, str_data, None);
            lines.register(&mut line_sec, 0, &unit(None), &mut env).unwrap();
            lines
                .register(&mut line_sec, second_off, &unit(None), &mut env)
                .unwrap();
        }

        // A GNU extension unit: version 4, debug_line_offset flag set,
        // pointing at the second table.
        let mut data = Vec::new();
        data.extend_from_slice(&4u16.to_le_bytes());
        data.push(0x02); // flags: debug_line_offset follows
        data.extend_from_slice(&(second_off as u32).to_le_bytes());
        data.push(0x03); // start_file
        data.push(0); // line
        data.push(1); // file index
        data.push(0x01); // define
        data.push(1); // line
        data.extend_from_slice(b"A 1\0");
        data.push(0x05); // define_strp
        data.push(2); // line
        data.extend_from_slice(&11u32.to_le_bytes()); // "GUARD 1"
        data.push(0x04); // end_file
        data.push(0); // unit terminator
        let mut mac = section(".debug_macro", data);

        let sites = {
            let mut env = env(&mut strings, str_data, None);
            collect_macros(&mut mac, &[], &mut env).unwrap()
        };
        assert_eq!(sites.len(), 2);

        // Another sighting made the pool live; freeze and rebuild.
        strings
            .intern_replaced(str_data, 0, b"/tmp/build", b"/usr")
            .unwrap();
        strings.finalize().unwrap();
        lines.plan(&mut line_sec, LE).unwrap();
        assert!(lines.moved());

        rewrite_macros(&mut mac, &sites, &strings, &lines, LE).unwrap();

        assert_eq!(LE.read_u32(&mac.data[3..7]), (second_off - diff) as u32);
        assert_eq!(
            LE.read_u32(&mac.data[18..22]),
            strings.lookup(11).unwrap()
        );
        assert!(mac.dirty);
    }

    #[test]
    fn test_define_strx_resolves_through_str_offsets() {
        let mut so_data = Vec::new();
        so_data.extend_from_slice(&8u32.to_le_bytes()); // unit_length
        so_data.extend_from_slice(&5u16.to_le_bytes());
        so_data.extend_from_slice(&0u16.to_le_bytes());
        so_data.extend_from_slice(&4u32.to_le_bytes()); // entry 0 -> "X 7"
        let mut so_sec = section(".debug_str_offsets", so_data);

        let mut data = Vec::new();
        data.extend_from_slice(&5u16.to_le_bytes());
        data.push(0); // flags
        data.push(0x0b); // define_strx
        data.push(1); // line
        data.push(0); // string index
        data.push(0); // unit terminator
        let mut mac = section(".debug_macro", data);

        let str_data = b"pad\0X 7\0";
        let mut strings = StringPool::new(PoolKind::Str);
        let units = [unit(Some(0))];
        {
            let mut env = env(&mut strings, str_data, Some(&mut so_sec));
            let sites = collect_macros(&mut mac, &units, &mut env).unwrap();
            // The index slot itself is rewritten by the str-offsets pass.
            assert!(sites.is_empty());
        }

        strings.finalize().unwrap();
        assert_eq!(strings.lookup(4), Some(0));
        assert_eq!(strings.lookup(0), None);
    }

    #[test]
    fn test_unknown_opcode_is_fatal() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u16.to_le_bytes());
        data.push(0); // flags
        data.push(0x7f); // outside the recognized set
        let mut mac = section(".debug_macro", data);

        let mut strings = StringPool::new(PoolKind::Str);
        let mut env = env(&mut strings, &[], None);
        let err = collect_macros(&mut mac, &[], &mut env).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::EditErrorKind::UnknownMacroOpcode(0x7f)
        ));
    }

    #[test]
    fn test_bad_headers_are_fatal() {
        let mut strings = StringPool::new(PoolKind::Str);

        // 64-bit offset flag
        let mut mac = section(".debug_macro", vec![0x05, 0x00, 0x01]);
        let mut e = env(&mut strings, &[], None);
        let err = collect_macros(&mut mac, &[], &mut e).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::EditErrorKind::Dwarf64(".debug_macro", 0)
        ));

        // reserved flag bit
        let mut mac = section(".debug_macro", vec![0x05, 0x00, 0x04]);
        let mut e = env(&mut strings, &[], None);
        let err = collect_macros(&mut mac, &[], &mut e).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::EditErrorKind::MalformedDwarf(".debug_macro", 0)
        ));

        // unsupported version
        let mut mac = section(".debug_macro", vec![0x03, 0x00, 0x00]);
        let mut e = env(&mut strings, &[], None);
        let err = collect_macros(&mut mac, &[], &mut e).unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::EditErrorKind::UnsupportedVersion(3)
        ));
    }
}
