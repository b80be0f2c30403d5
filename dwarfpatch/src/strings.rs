//! Deduplicating rewriters for the `.debug_str` and `.debug_line_str` pools.
//!
//! Replacing path prefixes inside a string pool shifts the offset of every
//! string behind the edit, so the pool cannot be patched in place. Instead,
//! each referenced string is interned into a new deduplicated pool during the
//! collection pass, the pool is frozen once all references are known, and the
//! rewrite pass maps every old offset onto its new location.

use std::collections::{BTreeMap, HashMap};

use crate::error::{EditError, EditErrorKind};
use crate::paths;

/// The string injected for `.debug_str_offsets` entries that reference a
/// string no attribute ever reached.
pub const SENTINEL: &[u8] = b"<debugedit>";

/// Identifies which string pool an offset refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolKind {
    /// `.debug_str`, referenced by `DW_FORM_strp` and `DW_FORM_strx*`.
    Str,
    /// `.debug_line_str`, referenced by `DW_FORM_line_strp`.
    LineStr,
}

impl PoolKind {
    /// The ELF section name of this pool.
    pub fn section_name(self) -> &'static str {
        match self {
            PoolKind::Str => ".debug_str",
            PoolKind::LineStr => ".debug_line_str",
        }
    }
}

/// A rewriter for one string pool section.
///
/// Old offsets are keyed in a search tree so repeated sightings of the same
/// offset resolve to the same new entry without re-reading the bytes. The
/// interned strings themselves are deduplicated through a side table, so the
/// finalized pool never contains two identical entries.
#[derive(Debug)]
pub struct StringPool {
    kind: PoolKind,
    /// old offset -> handle into `strings`.
    entries: BTreeMap<u32, usize>,
    handles: HashMap<Box<[u8]>, usize>,
    strings: Vec<Box<[u8]>>,
    /// Per-handle offset in the finalized pool.
    offsets: Vec<Option<u32>>,
    buffer: Vec<u8>,
    sentinel: Option<usize>,
    replaced: bool,
    finalized: bool,
}

impl StringPool {
    /// Creates an empty pool rewriter.
    pub fn new(kind: PoolKind) -> Self {
        StringPool {
            kind,
            entries: BTreeMap::new(),
            handles: HashMap::new(),
            strings: Vec::new(),
            offsets: Vec::new(),
            buffer: Vec::new(),
            sentinel: None,
            replaced: false,
            finalized: false,
        }
    }

    /// Whether any interned string received a prefix replacement.
    ///
    /// A pool without replacements is left entirely untouched on disk, along
    /// with every section that references it.
    pub fn is_live(&self) -> bool {
        self.replaced
    }

    fn read_cstr<'d>(&self, data: &'d [u8], offset: u32) -> Result<&'d [u8], EditError> {
        let start = offset as usize;
        let rest = data
            .get(start..)
            .ok_or(EditErrorKind::MalformedDwarf(self.kind.section_name(), start))?;
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(EditErrorKind::MalformedDwarf(self.kind.section_name(), start))?;
        Ok(&rest[..nul])
    }

    fn add_string(&mut self, string: &[u8]) -> usize {
        if let Some(&handle) = self.handles.get(string) {
            return handle;
        }
        let handle = self.strings.len();
        self.strings.push(string.into());
        self.handles.insert(string.into(), handle);
        handle
    }

    /// Interns the string at `offset` in the original section verbatim.
    pub fn intern_existing(&mut self, data: &[u8], offset: u32) -> Result<(), EditError> {
        if self.entries.contains_key(&offset) {
            return Ok(());
        }
        let string = self.read_cstr(data, offset)?.to_vec();
        let handle = self.add_string(&string);
        self.entries.insert(offset, handle);
        Ok(())
    }

    /// Interns the string at `offset`, substituting the `base` prefix with
    /// `dest` when it applies. Returns `true` if a replacement was recorded.
    pub fn intern_replaced(
        &mut self,
        data: &[u8],
        offset: u32,
        base: &[u8],
        dest: &[u8],
    ) -> Result<bool, EditError> {
        let string = self.read_cstr(data, offset)?.to_vec();
        match paths::replace_prefix(&string, base, dest) {
            Some(replacement) if replacement != string => {
                let handle = self.add_string(&replacement);
                // A previous plain sighting of this offset is upgraded.
                self.entries.insert(offset, handle);
                self.replaced = true;
                Ok(true)
            }
            _ => {
                if !self.entries.contains_key(&offset) {
                    let handle = self.add_string(&string);
                    self.entries.insert(offset, handle);
                }
                Ok(false)
            }
        }
    }

    /// Installs the `"<debugedit>"` sentinel entry.
    ///
    /// Called when `.debug_str_offsets` is present, since that index may
    /// reference strings the info walk never reaches.
    pub fn ensure_sentinel(&mut self) {
        if self.sentinel.is_none() {
            self.sentinel = Some(self.add_string(SENTINEL));
        }
    }

    /// Freezes the pool and lays out the new section bytes.
    ///
    /// New offsets are assigned in ascending old-offset order, which makes
    /// the output deterministic for a given input and keeps a second run over
    /// an already-edited file byte-stable.
    pub fn finalize(&mut self) -> Result<(), EditError> {
        self.offsets = vec![None; self.strings.len()];
        self.buffer.clear();

        let sentinel = self.sentinel;
        let handles: Vec<usize> = sentinel
            .into_iter()
            .chain(self.entries.values().copied())
            .collect();
        for handle in handles {
            if self.offsets[handle].is_some() {
                continue;
            }
            let offset = u32::try_from(self.buffer.len()).map_err(|_| {
                EditErrorKind::MalformedDwarf(self.kind.section_name(), self.buffer.len())
            })?;
            self.offsets[handle] = Some(offset);
            self.buffer.extend_from_slice(&self.strings[handle]);
            self.buffer.push(0);
        }
        self.finalized = true;
        Ok(())
    }

    /// Maps an old offset onto its location in the finalized pool.
    pub fn lookup(&self, offset: u32) -> Option<u32> {
        debug_assert!(self.finalized, "string pool queried before finalize");
        let handle = *self.entries.get(&offset)?;
        self.offsets[handle]
    }

    /// The offset of the sentinel entry, if one was installed.
    pub fn sentinel_offset(&self) -> Option<u32> {
        debug_assert!(self.finalized, "string pool queried before finalize");
        self.offsets[self.sentinel?]
    }

    /// The finalized pool bytes.
    pub fn bytes(&self) -> &[u8] {
        debug_assert!(self.finalized, "string pool queried before finalize");
        &self.buffer
    }
}
