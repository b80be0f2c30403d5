//! The `.debug_info` and `.debug_types` walker.
//!
//! The walker dispatches on abbreviation and form for every DIE of every
//! unit. The collection pass interns all referenced strings, records the
//! per-unit context (stmt-list, comp-dir, str-offsets base, macro offset)
//! and remembers the byte position of every reference that may need
//! rewriting. Once the string pools and the new `.debug_line` are frozen,
//! the rewrite pass revisits exactly those positions through the relocation
//! protocol.

use std::collections::HashMap;

use gimli::constants;
use gimli::constants::DwForm;

use crate::editor::PassEnv;
use crate::elf::DebugSection;
use crate::error::{EditError, EditErrorKind};
use crate::forms;
use crate::line::LineTables;
use crate::paths;
use crate::reader::Reader;
use crate::relocs::RelocIndex;
use crate::strings::{PoolKind, StringPool};
use crate::Endian;

/// Per-unit context, created when a unit header is parsed.
#[derive(Debug)]
pub struct Unit {
    /// Offset of the unit header within its section.
    pub offset: usize,
    pub version: u16,
    pub address_size: u8,
    /// Origin in `.debug_str_offsets` for indexed string forms.
    pub str_offsets_base: u32,
    /// `DW_AT_macros` / `DW_AT_GNU_macros` value, if present.
    pub macros_offset: Option<u32>,
    /// `DW_AT_stmt_list` value, if present.
    pub stmt_list: Option<u32>,
    /// The unit's compilation directory, if present.
    pub comp_dir: Option<Vec<u8>>,
}

/// A byte position the rewrite pass has to revisit.
#[derive(Debug)]
pub enum EditSite {
    /// A `DW_FORM_strp` / `DW_FORM_line_strp` attribute value.
    Str { pos: usize, pool: PoolKind },
    /// A `DW_AT_stmt_list` attribute value.
    StmtList { pos: usize },
    /// An inline `DW_FORM_string` comp-dir whose prefix matched.
    CompDir { pos: usize, len: usize },
}

#[derive(Debug)]
struct AbbrevAttr {
    at: u64,
    form: u64,
}

#[derive(Debug)]
struct Abbrev {
    tag: u64,
    attrs: Vec<AbbrevAttr>,
}

type AbbrevTable = HashMap<u64, Abbrev>;

/// Parsed abbreviation tables, keyed by their `.debug_abbrev` offset.
///
/// Units routinely share one table; parsing is done once per offset.
#[derive(Debug, Default)]
pub struct AbbrevCache {
    tables: HashMap<u32, AbbrevTable>,
}

impl AbbrevCache {
    fn get(
        &mut self,
        data: &[u8],
        offset: u32,
        endian: Endian,
    ) -> Result<&AbbrevTable, EditError> {
        if !self.tables.contains_key(&offset) {
            let table = parse_abbrev(data, offset, endian)?;
            self.tables.insert(offset, table);
        }
        Ok(&self.tables[&offset])
    }
}

fn parse_abbrev(data: &[u8], offset: u32, endian: Endian) -> Result<AbbrevTable, EditError> {
    let mut r = Reader::new(data, endian, ".debug_abbrev");
    r.seek(offset as usize);

    let mut table = AbbrevTable::new();
    loop {
        let code = r.read_uleb128()?;
        if code == 0 {
            break;
        }
        let tag = r.read_uleb128()?;
        r.read_u8()?; // has_children
        let mut attrs = Vec::new();
        loop {
            let at = r.read_uleb128()?;
            let form = r.read_uleb128()?;
            if form == u64::from(constants::DW_FORM_implicit_const.0) {
                // The value lives in the abbreviation, not in the DIE.
                r.read_sleb128()?;
            }
            if at == 0 && form == 0 {
                break;
            }
            attrs.push(AbbrevAttr { at, form });
        }
        if table.insert(code, Abbrev { tag, attrs }).is_some() {
            return Err(EditErrorKind::MalformedDwarf(".debug_abbrev", offset as usize).into());
        }
    }
    Ok(table)
}

fn read_u32_field(
    relocs: &mut Option<RelocIndex>,
    data: &[u8],
    pos: usize,
    endian: Endian,
    section: &'static str,
) -> Result<u32, EditError> {
    use gimli::Endianity;
    if pos + 4 > data.len() {
        return Err(EditErrorKind::MalformedDwarf(section, pos).into());
    }
    Ok(match relocs {
        Some(index) => index.read_u32(data, pos, endian),
        None => endian.read_u32(&data[pos..pos + 4]),
    })
}

fn at_is(at: u64, known: constants::DwAt) -> bool {
    at == u64::from(known.0)
}

/// Collection pass over one `.debug_info` or `.debug_types` section.
///
/// Appends the units found to `units` in section byte order, registers
/// every referenced line table, and returns the edit sites for the rewrite
/// pass.
#[allow(clippy::too_many_arguments)]
pub fn collect_section(
    sec: &mut DebugSection,
    abbrev_data: &[u8],
    abbrevs: &mut AbbrevCache,
    mut line: Option<&mut DebugSection>,
    lines: &mut LineTables,
    units: &mut Vec<Unit>,
    is_types: bool,
    env: &mut PassEnv<'_>,
) -> Result<Vec<EditSite>, EditError> {
    let endian = env.endian;
    let sec_name = sec.name;
    let DebugSection { data, relocs, .. } = sec;
    let data: &[u8] = data;

    let mut sites = Vec::new();
    let mut r = Reader::new(data, endian, sec_name);

    while r.remaining() > 0 {
        let unit_offset = r.pos();
        let unit_length = r.read_u32()?;
        if unit_length == 0xffff_ffff {
            return Err(EditErrorKind::Dwarf64(sec_name, unit_offset).into());
        }
        let unit_end = unit_offset + 4 + unit_length as usize;
        if unit_end > data.len() {
            return Err(EditErrorKind::MalformedDwarf(sec_name, unit_offset).into());
        }

        let version = r.read_u16()?;
        if !(2..=5).contains(&version) {
            return Err(EditErrorKind::UnsupportedVersion(version).into());
        }

        let (abbrev_offset, address_size);
        if version >= 5 {
            let unit_type = r.read_u8()?;
            address_size = r.read_u8()?;
            let pos = r.pos();
            abbrev_offset = read_u32_field(relocs, data, pos, endian, sec_name)?;
            r.skip(4)?;
            if unit_type == constants::DW_UT_type.0 {
                // type_signature and type_offset
                r.skip(12)?;
            } else if unit_type != constants::DW_UT_compile.0
                && unit_type != constants::DW_UT_partial.0
            {
                return Err(EditErrorKind::MalformedDwarf(sec_name, unit_offset).into());
            }
        } else {
            let pos = r.pos();
            abbrev_offset = read_u32_field(relocs, data, pos, endian, sec_name)?;
            r.skip(4)?;
            address_size = r.read_u8()?;
            if is_types {
                r.skip(12)?;
            }
        }
        if address_size != 4 && address_size != 8 {
            return Err(EditErrorKind::MalformedDwarf(sec_name, unit_offset).into());
        }

        let mut unit = Unit {
            offset: unit_offset,
            version,
            address_size,
            // Without DW_AT_str_offsets_base, indexed strings start right
            // after the version 5 unit header.
            str_offsets_base: if version >= 5 { 8 } else { 0 },
            macros_offset: None,
            stmt_list: None,
            comp_dir: None,
        };

        let table = abbrevs.get(abbrev_data, abbrev_offset, endian)?;
        let mut root_seen = false;

        while r.pos() < unit_end {
            let code = r.read_uleb128()?;
            if code == 0 {
                continue;
            }
            let abbrev = table
                .get(&code)
                .ok_or(EditErrorKind::MalformedDwarf(sec_name, r.pos()))?;
            let is_root = !root_seen;
            root_seen = true;
            let replaceable_name = is_root
                && (abbrev.tag == u64::from(constants::DW_TAG_compile_unit.0)
                    || abbrev.tag == u64::from(constants::DW_TAG_partial_unit.0));

            for attr in &abbrev.attrs {
                let form = forms::resolve_indirect(&mut r, attr.form)?;
                let at = attr.at;
                let is_path_attr =
                    at_is(at, constants::DW_AT_comp_dir) || (replaceable_name && at_is(at, constants::DW_AT_name));

                match DwForm(form as u16) {
                    DwForm(f)
                        if f == constants::DW_FORM_strp.0 || f == constants::DW_FORM_line_strp.0 =>
                    {
                        let pool = if f == constants::DW_FORM_strp.0 {
                            PoolKind::Str
                        } else {
                            PoolKind::LineStr
                        };
                        let pos = r.pos();
                        let offset = read_u32_field(relocs, data, pos, endian, sec_name)?;
                        r.skip(4)?;
                        if is_path_attr {
                            env.intern_path(pool, offset)?;
                        } else {
                            env.intern_str(pool, offset)?;
                        }
                        sites.push(EditSite::Str { pos, pool });
                        if at_is(at, constants::DW_AT_comp_dir) && unit.comp_dir.is_none() {
                            unit.comp_dir = Some(env.pool_string(pool, offset)?);
                        }
                    }
                    DwForm(f)
                        if f == constants::DW_FORM_strx.0
                            || f == constants::DW_FORM_strx1.0
                            || f == constants::DW_FORM_strx2.0
                            || f == constants::DW_FORM_strx3.0
                            || f == constants::DW_FORM_strx4.0 =>
                    {
                        let index = if f == constants::DW_FORM_strx.0 {
                            r.read_uleb128()?
                        } else {
                            let size = match f {
                                f if f == constants::DW_FORM_strx1.0 => 1,
                                f if f == constants::DW_FORM_strx2.0 => 2,
                                f if f == constants::DW_FORM_strx3.0 => 3,
                                _ => 4,
                            };
                            r.read_uint(size)?
                        };
                        let offset = env.resolve_strx(&unit, index)?;
                        if is_path_attr {
                            env.intern_path(PoolKind::Str, offset)?;
                        } else {
                            env.intern_str(PoolKind::Str, offset)?;
                        }
                        if at_is(at, constants::DW_AT_comp_dir) && unit.comp_dir.is_none() {
                            unit.comp_dir = Some(env.pool_string(PoolKind::Str, offset)?);
                        }
                    }
                    constants::DW_FORM_string => {
                        let pos = r.pos();
                        let string = r.read_cstr()?;
                        if at_is(at, constants::DW_AT_comp_dir) {
                            if unit.comp_dir.is_none() {
                                unit.comp_dir = Some(string.to_vec());
                            }
                            if env.rewrite && env.base.is_some_and(|b| paths::skip_prefix(string, b).is_some())
                            {
                                sites.push(EditSite::CompDir {
                                    pos,
                                    len: string.len(),
                                });
                            }
                        }
                    }
                    DwForm(f)
                        if at_is(at, constants::DW_AT_stmt_list)
                            && (f == constants::DW_FORM_data4.0
                                || f == constants::DW_FORM_sec_offset.0) =>
                    {
                        let pos = r.pos();
                        let offset = read_u32_field(relocs, data, pos, endian, sec_name)?;
                        r.skip(4)?;
                        unit.stmt_list = Some(offset);
                        sites.push(EditSite::StmtList { pos });
                    }
                    DwForm(f)
                        if (at_is(at, constants::DW_AT_macros)
                            || at_is(at, constants::DW_AT_GNU_macros))
                            && (f == constants::DW_FORM_data4.0
                                || f == constants::DW_FORM_sec_offset.0) =>
                    {
                        let pos = r.pos();
                        let offset = read_u32_field(relocs, data, pos, endian, sec_name)?;
                        r.skip(4)?;
                        unit.macros_offset = Some(offset);
                    }
                    DwForm(f)
                        if at_is(at, constants::DW_AT_str_offsets_base)
                            && f == constants::DW_FORM_sec_offset.0 =>
                    {
                        let pos = r.pos();
                        let offset = read_u32_field(relocs, data, pos, endian, sec_name)?;
                        r.skip(4)?;
                        unit.str_offsets_base = offset;
                    }
                    _ => forms::skip_form(&mut r, form, version, address_size)?,
                }
            }
        }

        env.emit_comp_dir(&unit)?;
        if let Some(stmt_list) = unit.stmt_list {
            let line = line
                .as_deref_mut()
                .ok_or(EditErrorKind::MalformedDwarf(sec_name, unit.offset))?;
            lines.register(line, stmt_list as usize, &unit, env)?;
        }
        units.push(unit);
        r.seek(unit_end);
    }

    Ok(sites)
}

/// Rewrite pass: revisits the recorded edit sites of one section.
#[allow(clippy::too_many_arguments)]
pub fn rewrite_section(
    sec: &mut DebugSection,
    sites: &[EditSite],
    lines: &LineTables,
    strings: &StringPool,
    line_strings: Option<&StringPool>,
    base: Option<&[u8]>,
    dest: Option<&[u8]>,
    endian: Endian,
) -> Result<(), EditError> {
    for site in sites {
        match *site {
            EditSite::Str { pos, pool } => {
                let pool = match pool {
                    PoolKind::Str => strings,
                    PoolKind::LineStr => match line_strings {
                        Some(pool) => pool,
                        None => continue,
                    },
                };
                if !pool.is_live() {
                    continue;
                }
                let old = sec.read_u32_rel(pos, endian)?;
                match pool.lookup(old) {
                    Some(new) => sec.write_u32_rel(pos, new, endian)?,
                    None => tracing::warn!(
                        offset = old,
                        section = sec.name,
                        "string reference missing from the rewritten pool"
                    ),
                }
            }
            EditSite::StmtList { pos } => {
                if !lines.moved() {
                    continue;
                }
                let old = sec.read_u32_rel(pos, endian)?;
                match lines.lookup(old) {
                    Some(new) => sec.write_u32_rel(pos, new, endian)?,
                    None => {
                        return Err(EditErrorKind::MalformedDwarf(sec.name, pos).into());
                    }
                }
            }
            EditSite::CompDir { pos, len } => {
                rewrite_inline_comp_dir(sec, pos, len, base, dest);
            }
        }
    }
    Ok(())
}

/// Overwrites an inline `DW_FORM_string` comp-dir without resizing it.
///
/// The replacement must fit in the old string's bytes. A shorter
/// replacement is padded with slashes between the destination directory and
/// the original suffix, which leaves the path meaning unchanged.
fn rewrite_inline_comp_dir(
    sec: &mut DebugSection,
    pos: usize,
    len: usize,
    base: Option<&[u8]>,
    dest: Option<&[u8]>,
) {
    let (base, dest) = match (base, dest) {
        (Some(base), Some(dest)) => (base, dest),
        _ => return,
    };
    let old = sec.data[pos..pos + len].to_vec();
    let suffix = match paths::skip_prefix(&old, base) {
        Some(suffix) => suffix.to_vec(),
        None => return,
    };

    let needed = dest.len() + suffix.len() + usize::from(!suffix.is_empty());
    if needed > len {
        tracing::warn!(
            old = %String::from_utf8_lossy(&old),
            new_len = needed,
            "inline compilation directory would grow; left unmodified"
        );
        return;
    }

    let mut replacement = Vec::with_capacity(len);
    replacement.extend_from_slice(dest);
    replacement.resize(len - suffix.len(), b'/');
    replacement.extend_from_slice(&suffix);

    if replacement != old {
        sec.data[pos..pos + len].copy_from_slice(&replacement);
        sec.dirty = true;
    }
}
