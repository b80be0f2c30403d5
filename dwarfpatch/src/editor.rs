//! The editing session: options, orchestration and persistence.
//!
//! A session loads every debug section the pipeline edits, runs the
//! collection pass, freezes the string pools and the new `.debug_line`,
//! runs the rewrite pass, and serializes the file. Only sections whose
//! bytes or relocations actually changed are replaced; an input with
//! nothing to rewrite is left untouched on disk.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use filetime::FileTime;

use crate::buildid;
use crate::elf::{recognize_debug_section, DebugSection, ElfFile};
use crate::error::{EditError, EditErrorKind};
use crate::info::{self, AbbrevCache, EditSite, Unit};
use crate::line::LineTables;
use crate::macros::{self, MacroSite};
use crate::paths;
use crate::strings::{PoolKind, StringPool};
use crate::stroffsets;
use crate::Endian;

/// Configuration of one editing session.
#[derive(Clone, Debug)]
pub struct EditOptions {
    /// Build-time prefix to replace, as raw path bytes.
    pub base_dir: Option<Vec<u8>>,
    /// Install-time prefix to substitute. Requires `base_dir`.
    pub dest_dir: Option<Vec<u8>>,
    /// File to append null-terminated source paths to.
    pub list_file: Option<PathBuf>,
    /// Recompute or report the GNU build-id note.
    pub build_id: bool,
    /// Seed bytes mixed into the build-id hash. Requires `build_id`.
    pub build_id_seed: Option<Vec<u8>>,
    /// When false, the note bytes are reported but left unchanged.
    pub recompute_build_id: bool,
    /// Restore access and modification times after editing.
    pub preserve_dates: bool,
}

impl Default for EditOptions {
    fn default() -> Self {
        EditOptions {
            base_dir: None,
            dest_dir: None,
            list_file: None,
            build_id: false,
            build_id_seed: None,
            recompute_build_id: true,
            preserve_dates: false,
        }
    }
}

impl EditOptions {
    /// Checks inter-option constraints.
    pub fn validate(&self) -> Result<(), EditError> {
        if self.dest_dir.is_some() && self.base_dir.is_none() {
            return Err(EditErrorKind::InvalidOptions("--dest-dir requires --base-dir").into());
        }
        if let Some(seed) = &self.build_id_seed {
            if !self.build_id {
                return Err(
                    EditErrorKind::InvalidOptions("--build-id-seed requires --build-id").into(),
                );
            }
            if seed.is_empty() {
                return Err(
                    EditErrorKind::InvalidOptions("--build-id-seed must not be empty").into(),
                );
            }
        }
        Ok(())
    }
}

/// The outcome of an editing session.
#[derive(Debug, Default)]
pub struct EditSummary {
    /// Final build-id note bytes, when `build_id` was requested.
    pub build_id: Option<Vec<u8>>,
}

/// Append-only writer for the sources list.
pub(crate) struct SourceList {
    writer: BufWriter<File>,
}

impl SourceList {
    fn create(path: &Path) -> Result<Self, EditError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EditError::io("open list file", e))?;
        Ok(SourceList {
            writer: BufWriter::new(file),
        })
    }

    pub(crate) fn write_entry(&mut self, bytes: &[u8]) -> Result<(), EditError> {
        self.writer
            .write_all(bytes)
            .and_then(|_| self.writer.write_all(&[0]))
            .map_err(|e| EditError::io("write list file", e))
    }

    fn finish(mut self) -> Result<(), EditError> {
        self.writer
            .flush()
            .and_then(|_| self.writer.get_ref().sync_all())
            .map_err(|e| EditError::io("write list file", e))
    }
}

/// Shared state threaded through the collection pass.
pub(crate) struct PassEnv<'a> {
    pub endian: Endian,
    /// True when both prefixes are configured and paths are rewritten.
    pub rewrite: bool,
    pub base: Option<&'a [u8]>,
    pub dest: Option<&'a [u8]>,
    pub strings: &'a mut StringPool,
    pub line_strings: Option<&'a mut StringPool>,
    /// Original `.debug_str` bytes.
    pub str_data: &'a [u8],
    /// Original `.debug_line_str` bytes.
    pub line_str_data: &'a [u8],
    pub str_offsets: Option<&'a mut DebugSection>,
    pub list: Option<&'a mut SourceList>,
}

fn cstr_at(data: &[u8], offset: usize, section: &'static str) -> Result<Vec<u8>, EditError> {
    let rest = data
        .get(offset..)
        .ok_or(EditErrorKind::MalformedDwarf(section, offset))?;
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(EditErrorKind::MalformedDwarf(section, offset))?;
    Ok(rest[..nul].to_vec())
}

impl<'a> PassEnv<'a> {
    pub fn wants_sources(&self) -> bool {
        self.list.is_some()
    }

    fn pool_parts<'s>(
        &'s mut self,
        pool: PoolKind,
    ) -> Result<(&'s mut StringPool, &'a [u8]), EditError> {
        match pool {
            PoolKind::Str => Ok((&mut *self.strings, self.str_data)),
            PoolKind::LineStr => {
                let pool = self
                    .line_strings
                    .as_deref_mut()
                    .ok_or(EditErrorKind::MalformedDwarf(".debug_line_str", 0))?;
                Ok((pool, self.line_str_data))
            }
        }
    }

    /// Interns a string sighting verbatim.
    pub fn intern_str(&mut self, pool: PoolKind, offset: u32) -> Result<(), EditError> {
        let (pool, data) = self.pool_parts(pool)?;
        pool.intern_existing(data, offset)
    }

    /// Interns a path sighting, applying the prefix replacement when
    /// rewriting is enabled.
    pub fn intern_path(&mut self, pool: PoolKind, offset: u32) -> Result<(), EditError> {
        if !self.rewrite {
            return self.intern_str(pool, offset);
        }
        let (base, dest) = match (self.base, self.dest) {
            (Some(base), Some(dest)) => (base, dest),
            _ => return self.intern_str(pool, offset),
        };
        let (pool, data) = self.pool_parts(pool)?;
        pool.intern_replaced(data, offset, base, dest).map(|_| ())
    }

    /// Reads the string at `offset` from the original pool bytes.
    pub fn pool_string(&self, pool: PoolKind, offset: u32) -> Result<Vec<u8>, EditError> {
        let data = match pool {
            PoolKind::Str => self.str_data,
            PoolKind::LineStr => self.line_str_data,
        };
        cstr_at(data, offset as usize, pool.section_name())
    }

    /// Resolves an indexed string form through the unit's str-offsets base.
    pub fn resolve_strx(&mut self, unit: &Unit, index: u64) -> Result<u32, EditError> {
        // Indexed strings require the version 5 str-offsets layout.
        if unit.version < 5 {
            return Err(EditErrorKind::MalformedDwarf(".debug_str_offsets", 0).into());
        }
        let endian = self.endian;
        let sec = self
            .str_offsets
            .as_deref_mut()
            .ok_or(EditErrorKind::MalformedDwarf(".debug_str_offsets", 0))?;
        let pos = unit.str_offsets_base as usize + index as usize * 4;
        sec.read_u32_rel(pos, endian)
    }

    /// Appends a resolved source path to the list, subject to the prefix
    /// filter.
    pub fn emit_source(&mut self, path: &[u8]) -> Result<(), EditError> {
        let canon = paths::canonicalize(path);
        let keep = match self.base {
            None => true,
            Some(base) => {
                paths::skip_prefix(&canon, base).is_some()
                    || self
                        .dest
                        .is_some_and(|dest| paths::skip_prefix(&canon, dest).is_some())
            }
        };
        if !keep {
            return Ok(());
        }
        match self.list.as_deref_mut() {
            Some(list) => list.write_entry(&canon),
            None => Ok(()),
        }
    }

    /// Appends a unit's compilation directory, with a trailing slash.
    pub fn emit_comp_dir(&mut self, unit: &Unit) -> Result<(), EditError> {
        let comp_dir = match &unit.comp_dir {
            Some(comp_dir) => comp_dir,
            None => return Ok(()),
        };
        let base = self.base;
        let list = match self.list.as_deref_mut() {
            Some(list) => list,
            None => return Ok(()),
        };
        let mut canon = paths::canonicalize(comp_dir);
        if let Some(base) = base {
            if paths::skip_prefix(&canon, base).is_none() {
                return Ok(());
            }
        }
        if !canon.ends_with(b"/") {
            canon.push(b'/');
        }
        list.write_entry(&canon)
    }
}

/// Restores the original file mode on drop.
struct AccessGuard {
    path: PathBuf,
    original: Option<fs::Permissions>,
}

impl AccessGuard {
    fn ensure_writable(
        path: &Path,
        metadata: &fs::Metadata,
        needed: bool,
    ) -> Result<Self, EditError> {
        let mut guard = AccessGuard {
            path: path.to_path_buf(),
            original: None,
        };
        if needed && metadata.permissions().readonly() {
            let original = metadata.permissions();
            let mut writable = original.clone();
            #[allow(clippy::permissions_set_readonly_false)]
            writable.set_readonly(false);
            fs::set_permissions(path, writable)
                .map_err(|e| EditError::io("make file writable", e))?;
            guard.original = Some(original);
        }
        Ok(guard)
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            let _ = fs::set_permissions(&self.path, original);
        }
    }
}

/// The debug sections one session materializes.
#[derive(Default)]
struct Pipeline {
    info: Option<DebugSection>,
    abbrev: Option<DebugSection>,
    line: Option<DebugSection>,
    strings: Option<DebugSection>,
    line_str: Option<DebugSection>,
    str_offsets: Option<DebugSection>,
    macros: Vec<DebugSection>,
    types: Vec<DebugSection>,
}

impl Pipeline {
    fn load(file: &ElfFile) -> Result<Self, EditError> {
        let mut pipe = Pipeline::default();
        for index in 1..file.section_headers.len() {
            let name = match recognize_debug_section(file.section_name(index)) {
                Some(name) => name,
                None => continue,
            };
            let slot = match name {
                ".debug_info" => &mut pipe.info,
                ".debug_abbrev" => &mut pipe.abbrev,
                ".debug_line" => &mut pipe.line,
                ".debug_str" => &mut pipe.strings,
                ".debug_line_str" => &mut pipe.line_str,
                ".debug_str_offsets" => &mut pipe.str_offsets,
                ".debug_macro" => {
                    pipe.macros.push(file.load_debug_section(index)?);
                    continue;
                }
                ".debug_types" => {
                    pipe.types.push(file.load_debug_section(index)?);
                    continue;
                }
                // Recognized, but carried through verbatim.
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(file.load_debug_section(index)?);
            }
        }
        Ok(pipe)
    }
}

/// Runs both DWARF passes and returns the dirty-section replacements.
fn edit_dwarf(
    file: &ElfFile,
    base: Option<&[u8]>,
    dest: Option<&[u8]>,
    list: &mut Option<SourceList>,
) -> Result<HashMap<usize, Vec<u8>>, EditError> {
    let endian = file.endian();
    let mut pipe = Pipeline::load(file)?;
    if pipe.info.is_some() && pipe.abbrev.is_none() {
        return Err(EditErrorKind::MalformedDwarf(".debug_abbrev", 0).into());
    }

    let rewrite = base.is_some() && dest.is_some();
    let mut strings = StringPool::new(PoolKind::Str);
    let mut line_strings = pipe.line_str.as_ref().map(|_| StringPool::new(PoolKind::LineStr));
    let mut lines = LineTables::new();
    let mut abbrevs = AbbrevCache::default();
    let mut units: Vec<Unit> = Vec::new();
    let mut info_sites: Vec<EditSite> = Vec::new();
    let mut types_sites: Vec<Vec<EditSite>> = Vec::new();
    let mut macro_sites: Vec<Vec<MacroSite>> = Vec::new();

    // Pass 0: collect strings, line tables and per-unit context.
    {
        let abbrev_data: &[u8] = pipe
            .abbrev
            .as_ref()
            .map(|sec| sec.data.as_slice())
            .unwrap_or(&[]);
        let mut env = PassEnv {
            endian,
            rewrite,
            base,
            dest,
            strings: &mut strings,
            line_strings: line_strings.as_mut(),
            str_data: pipe
                .strings
                .as_ref()
                .map(|sec| sec.data.as_slice())
                .unwrap_or(&[]),
            line_str_data: pipe
                .line_str
                .as_ref()
                .map(|sec| sec.data.as_slice())
                .unwrap_or(&[]),
            str_offsets: pipe.str_offsets.as_mut(),
            list: list.as_mut(),
        };

        if let Some(info_sec) = pipe.info.as_mut() {
            info_sites = info::collect_section(
                info_sec,
                abbrev_data,
                &mut abbrevs,
                pipe.line.as_mut(),
                &mut lines,
                &mut units,
                false,
                &mut env,
            )?;
        }
        for types_sec in pipe.types.iter_mut() {
            types_sites.push(info::collect_section(
                types_sec,
                abbrev_data,
                &mut abbrevs,
                pipe.line.as_mut(),
                &mut lines,
                &mut units,
                true,
                &mut env,
            )?);
        }
        for macro_sec in pipe.macros.iter_mut() {
            macro_sites.push(macros::collect_macros(macro_sec, &units, &mut env)?);
        }
    }

    // Plan: freeze the pools and rebuild `.debug_line`.
    if strings.is_live() && pipe.str_offsets.is_some() {
        strings.ensure_sentinel();
    }
    strings.finalize()?;
    if let Some(pool) = line_strings.as_mut() {
        pool.finalize()?;
    }
    if let Some(line_sec) = pipe.line.as_mut() {
        lines.plan(line_sec, endian)?;
    }

    // Pass 1: rewrite every reference through the relocation protocol.
    if let Some(info_sec) = pipe.info.as_mut() {
        info::rewrite_section(
            info_sec,
            &info_sites,
            &lines,
            &strings,
            line_strings.as_ref(),
            base,
            dest,
            endian,
        )?;
    }
    for (types_sec, sites) in pipe.types.iter_mut().zip(&types_sites) {
        info::rewrite_section(
            types_sec,
            sites,
            &lines,
            &strings,
            line_strings.as_ref(),
            base,
            dest,
            endian,
        )?;
    }
    if let Some(line_sec) = pipe.line.as_mut() {
        lines.rewrite_v5_fields(line_sec, &strings, line_strings.as_ref(), endian)?;
    }
    for (macro_sec, sites) in pipe.macros.iter_mut().zip(&macro_sites) {
        macros::rewrite_macros(macro_sec, sites, &strings, &lines, endian)?;
    }
    if let Some(str_offsets_sec) = pipe.str_offsets.as_mut() {
        stroffsets::rewrite_str_offsets(str_offsets_sec, &strings, endian)?;
    }

    // Swap in the rebuilt string pools.
    if strings.is_live() {
        if let Some(sec) = pipe.strings.as_mut() {
            sec.data = strings.bytes().to_vec();
            sec.dirty = true;
        }
    }
    if let Some(pool) = &line_strings {
        if pool.is_live() {
            if let Some(sec) = pipe.line_str.as_mut() {
                sec.data = pool.bytes().to_vec();
                sec.dirty = true;
            }
        }
    }

    let mut replacements = HashMap::new();
    let mut commit = |sec: &DebugSection| -> Result<(), EditError> {
        if sec.dirty {
            let bytes = match sec.compression {
                Some(compression) => file.compress_section(&sec.data, compression)?,
                None => sec.data.clone(),
            };
            replacements.insert(sec.shndx, bytes);
        }
        if let Some(relocs) = &sec.relocs {
            if relocs.dirty {
                replacements.insert(relocs.shndx, relocs.serialize(file.is_64(), endian));
            }
        }
        Ok(())
    };

    for sec in [
        &pipe.info,
        &pipe.abbrev,
        &pipe.line,
        &pipe.strings,
        &pipe.line_str,
        &pipe.str_offsets,
    ]
    .into_iter()
    .flatten()
    {
        commit(sec)?;
    }
    for sec in pipe.macros.iter().chain(pipe.types.iter()) {
        commit(sec)?;
    }

    Ok(replacements)
}

fn write_note(path: &Path, offset: u64, bytes: &[u8]) -> Result<(), EditError> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| EditError::io("open output file", e))?;
    file.seek(SeekFrom::Start(offset))
        .and_then(|_| file.write_all(bytes))
        .map_err(|e| EditError::io("write build-id note", e))
}

/// Edits the file at `path` according to `options`.
///
/// Runs the full pipeline: source-path rewriting and source listing when
/// configured, then the optional build-id recomputation over the written
/// file. A fatal condition aborts before any byte reaches the disk.
pub fn edit_file(path: &Path, options: &EditOptions) -> Result<EditSummary, EditError> {
    options.validate()?;

    let metadata = fs::metadata(path).map_err(|e| EditError::io("stat input file", e))?;
    let saved_times = options.preserve_dates.then(|| {
        (
            FileTime::from_last_access_time(&metadata),
            FileTime::from_last_modification_time(&metadata),
        )
    });

    let rewrite = options.base_dir.is_some() && options.dest_dir.is_some();
    let may_write = rewrite || (options.build_id && options.recompute_build_id);
    let _access = AccessGuard::ensure_writable(path, &metadata, may_write)?;

    let base = options.base_dir.as_deref().map(paths::canonicalize);
    let dest = options.dest_dir.as_deref().map(paths::canonicalize);

    let file = ElfFile::open(path)?;
    let mut list = options
        .list_file
        .as_deref()
        .map(SourceList::create)
        .transpose()?;

    let replacements = if options.base_dir.is_some() || list.is_some() {
        edit_dwarf(&file, base.as_deref(), dest.as_deref(), &mut list)?
    } else {
        HashMap::new()
    };

    if let Some(list) = list.take() {
        list.finish()?;
    }

    let final_file = if replacements.is_empty() {
        file
    } else {
        let out = file.write_file(&replacements)?;
        fs::write(path, &out).map_err(|e| EditError::io("write output file", e))?;
        ElfFile::parse(out)?
    };

    let mut summary = EditSummary::default();
    if options.build_id {
        let note = buildid::find_build_id(&final_file)?.ok_or(EditErrorKind::MissingBuildId)?;
        if options.recompute_build_id {
            let digest =
                buildid::recompute(&final_file, &note, options.build_id_seed.as_deref())?;
            let offset =
                final_file.section_headers[note.shndx].sh_offset + note.desc_offset as u64;
            write_note(path, offset, &digest)?;
            summary.build_id = Some(digest);
        } else {
            summary.build_id = Some(buildid::note_desc(&final_file, &note)?.to_vec());
        }
    }

    if let Some((atime, mtime)) = saved_times {
        filetime::set_file_times(path, atime, mtime)
            .map_err(|e| EditError::io("restore timestamps", e))?;
    }
    Ok(summary)
}
