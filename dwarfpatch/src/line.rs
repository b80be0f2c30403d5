//! The `.debug_line` rewriter.
//!
//! Line-program headers of DWARF 2-4 embed directory and file names as
//! inline strings, so replacing a path prefix changes the size of the header
//! and shifts every later table in the section. The rewriter parses each
//! referenced table during the collection pass, plans the new sizes, and
//! emits a replacement section with a complete old-offset to new-offset map
//! that the info walker and the relocation fixup consult.
//!
//! DWARF 5 tables keep their size: their path strings live in `.debug_str`
//! or `.debug_line_str`, and only the embedded 32-bit string offsets are
//! rewritten in place.

use std::collections::HashMap;

use gimli::constants;

use crate::editor::PassEnv;
use crate::elf::DebugSection;
use crate::error::{EditError, EditErrorKind};
use crate::forms;
use crate::info::Unit;
use crate::paths;
use crate::reader::{uleb128_size, write_uleb128, Reader};
use crate::relocs::RelocIndex;
use crate::strings::{PoolKind, StringPool};
use crate::Endian;

const SEC: &str = ".debug_line";

/// A directory or file name from a version 2-4 table, together with its
/// planned replacement.
#[derive(Debug)]
struct LineString {
    bytes: Vec<u8>,
    replacement: Option<Vec<u8>>,
}

impl LineString {
    fn plan(bytes: Vec<u8>, env: &PassEnv<'_>) -> Self {
        let replacement = match (env.base, env.dest) {
            (Some(base), Some(dest)) => {
                paths::replace_prefix(&bytes, base, dest).filter(|r| *r != bytes)
            }
            _ => None,
        };
        LineString { bytes, replacement }
    }

    fn emitted(&self) -> &[u8] {
        self.replacement.as_deref().unwrap_or(&self.bytes)
    }
}

/// A version 2-4 file table entry.
#[derive(Debug)]
struct LineFile {
    name: LineString,
    dir: u64,
    mtime: u64,
    length: u64,
}

/// The absolute position of a 32-bit string offset embedded in a version 5
/// header.
#[derive(Debug)]
struct StrRef {
    pos: usize,
    pool: PoolKind,
}

/// Descriptor of one line-program table.
#[derive(Debug)]
pub struct LineTable {
    old_off: usize,
    old_end: usize,
    new_off: usize,
    size_diff: i64,
    version: u16,
    header_length: u32,
    header_length_pos: usize,
    /// Start of the directory table in the old section.
    dirs_start: usize,
    /// End of the file table in the old section.
    tables_end: usize,
    dirs: Vec<LineString>,
    files: Vec<LineFile>,
    replace_dirs: bool,
    replace_files: bool,
    v5_dirs: Vec<Vec<u8>>,
    /// (file name, directory index)
    v5_files: Vec<(Vec<u8>, u64)>,
    v5_path_fields: Vec<StrRef>,
}

impl LineTable {
    fn needs_rewrite(&self) -> bool {
        self.replace_dirs || self.replace_files
    }
}

/// All line tables referenced from `.debug_info` and `.debug_types`.
#[derive(Debug, Default)]
pub struct LineTables {
    tables: Vec<LineTable>,
    by_old: HashMap<usize, usize>,
    rebuilt: bool,
}

fn read_u32_field(
    relocs: &mut Option<RelocIndex>,
    data: &[u8],
    pos: usize,
    endian: Endian,
) -> Result<u32, EditError> {
    use gimli::Endianity;
    if pos + 4 > data.len() {
        return Err(EditErrorKind::MalformedDwarf(SEC, pos).into());
    }
    Ok(match relocs {
        Some(index) => index.read_u32(data, pos, endian),
        None => endian.read_u32(&data[pos..pos + 4]),
    })
}

impl LineTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the table at `off` for the given unit and emits the unit's
    /// resolved source files.
    ///
    /// The first sighting parses the table, plans prefix replacements and
    /// interns version 5 path strings; later sightings from other units
    /// reuse the parse but still emit their own source list entries.
    pub fn register(
        &mut self,
        line: &mut DebugSection,
        off: usize,
        unit: &Unit,
        env: &mut PassEnv<'_>,
    ) -> Result<(), EditError> {
        let index = match self.by_old.get(&off) {
            Some(&index) => index,
            None => {
                let table = parse_table(line, off, unit, env)?;
                let index = self.tables.len();
                self.by_old.insert(off, index);
                self.tables.push(table);
                index
            }
        };
        self.emit_sources(index, unit, env)
    }

    fn emit_sources(
        &self,
        index: usize,
        unit: &Unit,
        env: &mut PassEnv<'_>,
    ) -> Result<(), EditError> {
        if !env.wants_sources() {
            return Ok(());
        }
        let table = &self.tables[index];
        let comp_dir: &[u8] = unit.comp_dir.as_deref().unwrap_or(b"");

        if table.version <= 4 {
            for file in &table.files {
                let dir: &[u8] = match file.dir {
                    0 => b"",
                    n => &table.dirs[n as usize - 1].bytes,
                };
                let resolved = paths::join(&paths::join(comp_dir, dir), &file.name.bytes);
                env.emit_source(&resolved)?;
            }
        } else {
            for (name, dir) in &table.v5_files {
                let dir = &table.v5_dirs[*dir as usize];
                let resolved = paths::join(&paths::join(comp_dir, dir), name);
                env.emit_source(&resolved)?;
            }
        }
        Ok(())
    }

    /// Whether the planned section moved any table.
    pub fn moved(&self) -> bool {
        self.rebuilt
    }

    /// Maps a table's old starting offset onto its new one.
    pub fn lookup(&self, old: u32) -> Option<u32> {
        let index = self
            .tables
            .binary_search_by_key(&(old as usize), |t| t.old_off)
            .ok()?;
        Some(self.tables[index].new_off as u32)
    }

    /// Maps an arbitrary old section position onto the rebuilt section.
    ///
    /// Positions behind a rewritten header additionally shift by that
    /// table's size difference.
    pub fn map_pos(&self, pos: u64) -> u64 {
        if !self.rebuilt {
            return pos;
        }
        let index = self.tables.partition_point(|t| t.old_off as u64 <= pos);
        if index == 0 {
            return pos;
        }
        let table = &self.tables[index - 1];
        let shift = table.new_off as i64 - table.old_off as i64;
        let pos = pos as i64;
        if (pos as usize) < table.old_end && (pos as usize) < table.tables_end {
            (pos + shift) as u64
        } else {
            (pos + shift + table.size_diff) as u64
        }
    }

    /// Rebuilds `.debug_line` if any table changed size.
    ///
    /// Tables needing no rewrite are copied verbatim, as are the gaps
    /// between registered tables. Relocations into the section are
    /// re-pointed afterwards.
    pub fn plan(&mut self, line: &mut DebugSection, endian: Endian) -> Result<(), EditError> {
        self.tables.sort_by_key(|t| t.old_off);
        self.by_old.clear();

        if !self.tables.iter().any(LineTable::needs_rewrite) {
            for table in &mut self.tables {
                table.new_off = table.old_off;
            }
            return Ok(());
        }

        let old = std::mem::take(&mut line.data);
        let mut out = Vec::with_capacity(old.len());
        let mut cursor = 0;
        for table in &mut self.tables {
            if table.old_off < cursor {
                return Err(EditErrorKind::MalformedDwarf(SEC, table.old_off).into());
            }
            out.extend_from_slice(&old[cursor..table.old_off]);
            table.new_off = out.len();
            emit_table(table, &old, &mut out, endian)?;
            cursor = table.old_end;
        }
        out.extend_from_slice(&old[cursor..]);

        line.data = out;
        line.dirty = true;
        self.rebuilt = true;

        if let Some(relocs) = line.relocs.as_mut() {
            relocs.shift_offsets(|off| self.map_pos(off));
        }
        Ok(())
    }

    /// Rewrites the string offsets embedded in version 5 headers.
    ///
    /// Runs after the string pools are finalized and the section has been
    /// rebuilt; only pools that actually received replacements are applied.
    pub fn rewrite_v5_fields(
        &self,
        line: &mut DebugSection,
        strings: &StringPool,
        line_strings: Option<&StringPool>,
        endian: Endian,
    ) -> Result<(), EditError> {
        for table in &self.tables {
            let shift = table.new_off as i64 - table.old_off as i64;
            for field in &table.v5_path_fields {
                let pool = match field.pool {
                    PoolKind::Str => strings,
                    PoolKind::LineStr => match line_strings {
                        Some(pool) => pool,
                        None => continue,
                    },
                };
                if !pool.is_live() {
                    continue;
                }
                let pos = (field.pos as i64 + shift) as usize;
                let old = line.read_u32_rel(pos, endian)?;
                match pool.lookup(old) {
                    Some(new) => line.write_u32_rel(pos, new, endian)?,
                    None => tracing::warn!(
                        offset = old,
                        "line table references a string missing from the rewritten pool"
                    ),
                }
            }
        }
        Ok(())
    }
}

/// Parses one line-program table starting at `off`.
fn parse_table(
    line: &mut DebugSection,
    off: usize,
    unit: &Unit,
    env: &mut PassEnv<'_>,
) -> Result<LineTable, EditError> {
    let endian = env.endian;
    let DebugSection { data, relocs, .. } = line;
    let data: &[u8] = data;

    let mut r = Reader::new(data, endian, SEC);
    r.seek(off);

    let unit_length = r.read_u32()?;
    if unit_length == 0xffff_ffff {
        return Err(EditErrorKind::Dwarf64(SEC, off).into());
    }
    let old_end = off + 4 + unit_length as usize;
    if old_end > data.len() {
        return Err(EditErrorKind::MalformedDwarf(SEC, off).into());
    }

    let version = r.read_u16()?;
    if !(2..=5).contains(&version) {
        return Err(EditErrorKind::UnsupportedVersion(version).into());
    }
    if version >= 5 {
        let address_size = r.read_u8()?;
        if address_size != unit.address_size {
            return Err(EditErrorKind::MalformedDwarf(SEC, r.pos()).into());
        }
        let segment_selector_size = r.read_u8()?;
        if segment_selector_size != 0 {
            return Err(EditErrorKind::MalformedDwarf(SEC, r.pos()).into());
        }
    }

    let header_length_pos = r.pos();
    let header_length = r.read_u32()?;
    let header_end = header_length_pos + 4 + header_length as usize;
    if header_end > old_end {
        return Err(EditErrorKind::MalformedDwarf(SEC, off).into());
    }

    r.read_u8()?; // minimum_instruction_length
    if version >= 4 {
        r.read_u8()?; // maximum_operations_per_instruction
    }
    r.read_u8()?; // default_is_stmt
    r.read_i8()?; // line_base
    r.read_u8()?; // line_range
    let opcode_base = r.read_u8()?;
    if opcode_base == 0 {
        return Err(EditErrorKind::MalformedDwarf(SEC, r.pos()).into());
    }
    r.skip(opcode_base as usize - 1)?;

    let dirs_start = r.pos();
    let mut table = LineTable {
        old_off: off,
        old_end,
        new_off: off,
        size_diff: 0,
        version,
        header_length,
        header_length_pos,
        dirs_start,
        tables_end: dirs_start,
        dirs: Vec::new(),
        files: Vec::new(),
        replace_dirs: false,
        replace_files: false,
        v5_dirs: Vec::new(),
        v5_files: Vec::new(),
        v5_path_fields: Vec::new(),
    };

    if version <= 4 {
        loop {
            let name = r.read_cstr()?;
            if name.is_empty() {
                break;
            }
            table.dirs.push(LineString::plan(name.to_vec(), env));
        }
        loop {
            let name = r.read_cstr()?;
            if name.is_empty() {
                break;
            }
            let dir = r.read_uleb128()?;
            let mtime = r.read_uleb128()?;
            let length = r.read_uleb128()?;
            if dir as usize > table.dirs.len() {
                return Err(EditErrorKind::MalformedDwarf(SEC, r.pos()).into());
            }
            table.files.push(LineFile {
                name: LineString::plan(name.to_vec(), env),
                dir,
                mtime,
                length,
            });
        }
        table.tables_end = r.pos();
        if table.tables_end > header_end {
            return Err(EditErrorKind::MalformedDwarf(SEC, off).into());
        }

        table.replace_dirs = table.dirs.iter().any(|d| d.replacement.is_some());
        table.replace_files = table.files.iter().any(|f| f.name.replacement.is_some());
        if table.needs_rewrite() {
            let mut new_size = 0usize;
            for dir in &table.dirs {
                new_size += dir.emitted().len() + 1;
            }
            new_size += 1; // directory table terminator
            for file in &table.files {
                new_size += file.name.emitted().len() + 1;
                new_size += uleb128_size(file.dir);
                new_size += uleb128_size(file.mtime);
                new_size += uleb128_size(file.length);
            }
            new_size += 1; // file table terminator
            table.size_diff = new_size as i64 - (table.tables_end - dirs_start) as i64;
        }
    } else {
        // Directory table: a format descriptor followed by the entries.
        let dir_format_count = r.read_u8()?;
        let mut dir_formats = Vec::with_capacity(usize::from(dir_format_count));
        for _ in 0..dir_format_count {
            dir_formats.push((r.read_uleb128()?, r.read_uleb128()?));
        }
        let dir_count = r.read_uleb128()?;
        for _ in 0..dir_count {
            let mut path = None;
            for &(content, form) in &dir_formats {
                if content == u64::from(constants::DW_LNCT_path.0) {
                    path = Some(read_path_entry(&mut r, form, relocs, data, unit, env, &mut table)?);
                } else {
                    forms::skip_form(&mut r, form, version, unit.address_size)?;
                }
            }
            let path = path.ok_or(EditErrorKind::MalformedDwarf(SEC, r.pos()))?;
            table.v5_dirs.push(path);
        }

        let file_format_count = r.read_u8()?;
        let mut file_formats = Vec::with_capacity(usize::from(file_format_count));
        for _ in 0..file_format_count {
            file_formats.push((r.read_uleb128()?, r.read_uleb128()?));
        }
        let file_count = r.read_uleb128()?;
        for _ in 0..file_count {
            let mut path = None;
            let mut dir = 0u64;
            for &(content, form) in &file_formats {
                if content == u64::from(constants::DW_LNCT_path.0) {
                    path = Some(read_path_entry(&mut r, form, relocs, data, unit, env, &mut table)?);
                } else if content == u64::from(constants::DW_LNCT_directory_index.0) {
                    dir = read_dir_index(&mut r, form)?;
                } else {
                    forms::skip_form(&mut r, form, version, unit.address_size)?;
                }
            }
            let path = path.ok_or(EditErrorKind::MalformedDwarf(SEC, r.pos()))?;
            if dir as usize >= table.v5_dirs.len() {
                return Err(EditErrorKind::MalformedDwarf(SEC, r.pos()).into());
            }
            table.v5_files.push((path, dir));
        }
        table.tables_end = r.pos();
    }

    Ok(table)
}

/// Reads a `DW_LNCT_path` value, interning string-pool references and
/// recording their positions for the rewrite pass.
fn read_path_entry(
    r: &mut Reader<'_>,
    form: u64,
    relocs: &mut Option<RelocIndex>,
    data: &[u8],
    unit: &Unit,
    env: &mut PassEnv<'_>,
    table: &mut LineTable,
) -> Result<Vec<u8>, EditError> {
    use constants::*;

    let form = forms::resolve_indirect(r, form)?;
    match DwForm(form as u16) {
        DW_FORM_string => Ok(r.read_cstr()?.to_vec()),
        DW_FORM_strp => {
            let pos = r.pos();
            let offset = read_u32_field(relocs, data, pos, env.endian)?;
            r.skip(4)?;
            env.intern_path(PoolKind::Str, offset)?;
            table.v5_path_fields.push(StrRef {
                pos,
                pool: PoolKind::Str,
            });
            env.pool_string(PoolKind::Str, offset)
        }
        DW_FORM_line_strp => {
            let pos = r.pos();
            let offset = read_u32_field(relocs, data, pos, env.endian)?;
            r.skip(4)?;
            env.intern_path(PoolKind::LineStr, offset)?;
            table.v5_path_fields.push(StrRef {
                pos,
                pool: PoolKind::LineStr,
            });
            env.pool_string(PoolKind::LineStr, offset)
        }
        DW_FORM_strx | DW_FORM_strx1 | DW_FORM_strx2 | DW_FORM_strx3 | DW_FORM_strx4 => {
            let index = match DwForm(form as u16) {
                DW_FORM_strx => r.read_uleb128()?,
                DW_FORM_strx1 => r.read_uint(1)?,
                DW_FORM_strx2 => r.read_uint(2)?,
                DW_FORM_strx3 => r.read_uint(3)?,
                _ => r.read_uint(4)?,
            };
            let offset = env.resolve_strx(unit, index)?;
            env.intern_path(PoolKind::Str, offset)?;
            env.pool_string(PoolKind::Str, offset)
        }
        _ => Err(EditErrorKind::UnknownForm(form).into()),
    }
}

fn read_dir_index(r: &mut Reader<'_>, form: u64) -> Result<u64, EditError> {
    use constants::*;

    let form = forms::resolve_indirect(r, form)?;
    match DwForm(form as u16) {
        DW_FORM_udata => r.read_uleb128(),
        DW_FORM_data1 => r.read_uint(1),
        DW_FORM_data2 => r.read_uint(2),
        DW_FORM_data4 => r.read_uint(4),
        DW_FORM_data8 => r.read_uint(8),
        _ => Err(EditErrorKind::UnknownForm(form).into()),
    }
}

/// Writes one table into the rebuilt section.
fn emit_table(
    table: &LineTable,
    old: &[u8],
    out: &mut Vec<u8>,
    endian: Endian,
) -> Result<(), EditError> {
    use gimli::Endianity;

    if !table.needs_rewrite() {
        out.extend_from_slice(&old[table.old_off..table.old_end]);
        return Ok(());
    }

    let old_unit_length = (table.old_end - table.old_off - 4) as i64;
    let new_unit_length = u32::try_from(old_unit_length + table.size_diff)
        .map_err(|_| EditErrorKind::MalformedDwarf(SEC, table.old_off))?;
    let new_header_length = u32::try_from(i64::from(table.header_length) + table.size_diff)
        .map_err(|_| EditErrorKind::MalformedDwarf(SEC, table.old_off))?;

    let mut word = [0u8; 4];
    endian.write_u32(&mut word, new_unit_length);
    out.extend_from_slice(&word);
    out.extend_from_slice(&old[table.old_off + 4..table.header_length_pos]);
    endian.write_u32(&mut word, new_header_length);
    out.extend_from_slice(&word);
    out.extend_from_slice(&old[table.header_length_pos + 4..table.dirs_start]);

    for dir in &table.dirs {
        out.extend_from_slice(dir.emitted());
        out.push(0);
    }
    out.push(0);
    for file in &table.files {
        out.extend_from_slice(file.name.emitted());
        out.push(0);
        write_uleb128(out, file.dir);
        write_uleb128(out, file.mtime);
        write_uleb128(out, file.length);
    }
    out.push(0);

    // Header slack after the file table, then the unchanged program bytes.
    out.extend_from_slice(&old[table.tables_end..table.old_end]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::RunTimeEndian;

    const LE: Endian = RunTimeEndian::Little;

    fn section(data: Vec<u8>) -> DebugSection {
        DebugSection {
            name: ".debug_line",
            shndx: 8,
            data,
            compression: None,
            relocs: None,
            dirty: false,
        }
    }

    fn unit() -> Unit {
        Unit {
            offset: 0,
            version: 4,
            address_size: 8,
            str_offsets_base: 0,
            macros_offset: None,
            stmt_list: Some(0),
            comp_dir: Some(b"/tmp/build".to_vec()),
        }
    }

    /// A version 2 table with one directory and two files.
    fn build_v2_table(dir: &[u8]) -> Vec<u8> {
        // min_instr, default_is_stmt, line_base, line_range, opcode_base 1
        let header_body = [1u8, 1, 0xfb, 14, 1];
        let mut tables = Vec::new();
        tables.extend_from_slice(dir);
        tables.push(0);
        tables.push(0);
        tables.extend_from_slice(b"foo.c\0");
        tables.extend_from_slice(&[0, 0, 0]);
        tables.extend_from_slice(b"inc.h\0");
        tables.extend_from_slice(&[1, 0, 0]);
        tables.push(0);
        let program = [0u8, 1, 1]; // DW_LNE_end_sequence

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

    fn register_all(
        sec: &mut DebugSection,
        offsets: &[usize],
        strings: &mut StringPool,
        rewrite: bool,
    ) -> LineTables {
        let mut lines = LineTables::new();
        let mut env = PassEnv {
            endian: LE,
            rewrite,
            base: Some(b"/tmp/build"),
            dest: Some(b"/usr/src/debug/pkg"),
            strings,
            line_strings: None,
            str_data: b"/tmp/build\0foo.c\0",
            line_str_data: &[],
            str_offsets: None,
            list: None,
        };
        for &off in offsets {
            lines.register(sec, off, &unit(), &mut env).unwrap();
        }
        lines
    }

    #[test]
    fn test_v2_rewrite_grows_table() {
        let old = build_v2_table(b"/tmp/build/include");
        let mut sec = section(old.clone());
        let mut strings = StringPool::new(PoolKind::Str);

        let mut lines = register_all(&mut sec, &[0], &mut strings, true);
        lines.plan(&mut sec, LE).unwrap();

        let expected = build_v2_table(b"/usr/src/debug/pkg/include");
        assert!(lines.moved());
        assert!(sec.dirty);
        assert_eq!(sec.data, expected);
        assert_eq!(lines.lookup(0), Some(0));
        // Positions inside the program shift by the size difference.
        assert_eq!(
            lines.map_pos(old.len() as u64 - 1),
            expected.len() as u64 - 1
        );
    }

    #[test]
    fn test_untouched_table_is_verbatim() {
        let old = build_v2_table(b"/opt/other");
        let mut sec = section(old.clone());
        let mut strings = StringPool::new(PoolKind::Str);

        let mut lines = register_all(&mut sec, &[0], &mut strings, true);
        lines.plan(&mut sec, LE).unwrap();

        assert!(!lines.moved());
        assert!(!sec.dirty);
        assert_eq!(sec.data, old);
        assert_eq!(lines.lookup(0), Some(0));
    }

    #[test]
    fn test_later_tables_shift() {
        let first = build_v2_table(b"/tmp/build/include");
        let second = build_v2_table(b"/opt/other");
        let second_off = first.len();
        let mut data = first;
        data.extend_from_slice(&second);
        let mut sec = section(data);
        let mut strings = StringPool::new(PoolKind::Str);

        let mut lines = register_all(&mut sec, &[0, second_off], &mut strings, true);
        lines.plan(&mut sec, LE).unwrap();

        let grown = build_v2_table(b"/usr/src/debug/pkg/include");
        let diff = grown.len() - build_v2_table(b"/tmp/build/include").len();
        assert_eq!(lines.lookup(second_off as u32), Some((second_off + diff) as u32));
        // The second table is copied verbatim at its new position.
        assert_eq!(&sec.data[second_off + diff..], &second[..]);
    }

    /// A version 5 table whose paths are `.debug_str` offsets.
    fn build_v5_table(dir_strp: u32, file_strp: u32) -> (Vec<u8>, usize, usize) {
        let mut body = Vec::new();
        body.extend_from_slice(&[1u8, 1, 1, 0xfb, 14, 1]); // incl. max_ops
        body.extend_from_slice(&[1, 0x01, 0x0e]); // one dir format: path, strp
        body.push(1); // directory count
        let dir_pos_in_body = body.len();
        body.extend_from_slice(&dir_strp.to_le_bytes());
        body.extend_from_slice(&[2, 0x01, 0x0e, 0x02, 0x0f]); // path strp, dir udata
        body.push(1); // file count
        let file_pos_in_body = body.len();
        body.extend_from_slice(&file_strp.to_le_bytes());
        body.push(0); // directory index
        let header_length = body.len() as u32;

        let program = [0u8, 1, 1];
        let unit_length = (2 + 1 + 1 + 4 + body.len() + program.len()) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(&unit_length.to_le_bytes());
        out.extend_from_slice(&5u16.to_le_bytes());
        out.push(8); // address_size
        out.push(0); // segment_selector_size
        out.extend_from_slice(&header_length.to_le_bytes());
        let body_start = out.len();
        out.extend_from_slice(&body);
        out.extend_from_slice(&program);
        (out, body_start + dir_pos_in_body, body_start + file_pos_in_body)
    }

    #[test]
    fn test_v5_paths_rewritten_in_place() {
        let (data, dir_pos, file_pos) = build_v5_table(0, 11);
        let old_len = data.len();
        let mut sec = section(data);
        let mut strings = StringPool::new(PoolKind::Str);

        let mut lines = register_all(&mut sec, &[0], &mut strings, true);
        assert!(strings.is_live());
        strings.finalize().unwrap();

        lines.plan(&mut sec, LE).unwrap();
        assert!(!lines.moved());
        lines
            .rewrite_v5_fields(&mut sec, &strings, None, LE)
            .unwrap();

        use gimli::Endianity;
        assert_eq!(sec.data.len(), old_len);
        // "/tmp/build" keeps offset 0, "foo.c" moved behind the longer
        // replacement string.
        assert_eq!(LE.read_u32(&sec.data[dir_pos..dir_pos + 4]), 0);
        assert_eq!(
            LE.read_u32(&sec.data[file_pos..file_pos + 4]),
            strings.lookup(11).unwrap()
        );
        assert!(sec.dirty);
    }
}
