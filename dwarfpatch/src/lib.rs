//! Editing of DWARF debug information embedded in ELF files.
//!
//! This crate rewrites source-path prefixes inside the debug sections of an
//! object file, shared library or executable, mapping a build-time
//! directory onto an install-time directory. It can emit the list of source
//! files a binary refers to, and recompute the GNU build-id note over the
//! modified contents with a deterministic, seedable hash.
//!
//! The entry point is [`edit_file`], configured through [`EditOptions`]:
//!
//! ```no_run
//! use dwarfpatch::EditOptions;
//!
//! let options = EditOptions {
//!     base_dir: Some(b"/tmp/build".to_vec()),
//!     dest_dir: Some(b"/usr/src/debug/pkg".to_vec()),
//!     ..Default::default()
//! };
//! dwarfpatch::edit_file("build/foo.o".as_ref(), &options)?;
//! # Ok::<(), dwarfpatch::EditError>(())
//! ```
//!
//! # Background
//!
//! DWARF cross-references its sections aggressively: `.debug_info`
//! attributes hold offsets into `.debug_str`, `.debug_line_str`,
//! `.debug_line` and `.debug_macro`, and in relocatable objects those
//! offsets may live in relocation addends rather than section bytes.
//! Replacing a path therefore ripples through the whole file. The editor
//! runs two passes: a collection pass that interns every referenced string
//! and line table while planning the new layout, and a rewrite pass that
//! re-points every reference once the new offsets are known.

#![warn(missing_docs)]

pub mod buildid;
mod editor;
pub mod elf;
mod error;
mod forms;
mod info;
mod line;
mod macros;
mod paths;
mod reader;
mod relocs;
mod strings;
mod stroffsets;

pub use crate::editor::{edit_file, EditOptions, EditSummary};
pub use crate::error::{EditError, EditErrorKind};
pub use crate::paths::{canonicalize, is_absolute, join, replace_prefix, skip_prefix};
pub use crate::strings::SENTINEL;

/// The byte order of the file being edited.
pub use gimli::RunTimeEndian as Endian;
