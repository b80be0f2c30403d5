use std::error::Error;
use std::fmt;

use thiserror::Error;

/// The error kind for [`EditError`].
#[non_exhaustive]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EditErrorKind {
    /// The container is not a valid ELF file.
    MalformedElf,

    /// DWARF data in a debug section could not be parsed.
    ///
    /// Carries the section name and the byte offset at which parsing failed.
    MalformedDwarf(&'static str, usize),

    /// The 64-bit DWARF initial length marker was encountered.
    Dwarf64(&'static str, usize),

    /// A DWARF version outside the supported range.
    UnsupportedVersion(u16),

    /// An attribute form the walker does not know how to skip.
    UnknownForm(u64),

    /// A `.debug_macro` opcode outside the recognized set.
    UnknownMacroOpcode(u8),

    /// A compressed section uses an algorithm other than zlib.
    UnsupportedCompression,

    /// A relocation against a debug section has an unexpected type.
    BadRelocationType(u32),

    /// Inter-option constraints were violated.
    InvalidOptions(&'static str),

    /// The file has no GNU build-id note to rewrite.
    MissingBuildId,

    /// An environment-level failure. The payload names the operation.
    Io(&'static str),
}

impl fmt::Display for EditErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedElf => write!(f, "invalid ELF file"),
            Self::MalformedDwarf(section, offset) => {
                write!(f, "malformed DWARF in {section} at offset {offset:#x}")
            }
            Self::Dwarf64(section, offset) => write!(
                f,
                "64-bit DWARF is not supported ({section} at offset {offset:#x})"
            ),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported DWARF version {version}")
            }
            Self::UnknownForm(form) => write!(f, "unknown DWARF form {form:#x}"),
            Self::UnknownMacroOpcode(op) => {
                write!(f, "unknown .debug_macro opcode {op:#x}")
            }
            Self::UnsupportedCompression => write!(f, "unsupported section compression"),
            Self::BadRelocationType(rtype) => {
                write!(f, "unexpected relocation type {rtype} against debug section")
            }
            Self::InvalidOptions(message) => write!(f, "{message}"),
            Self::MissingBuildId => write!(f, "no GNU build-id note found"),
            Self::Io(operation) => write!(f, "cannot {operation}"),
        }
    }
}

/// An error editing the debug information of an ELF file.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct EditError {
    kind: EditErrorKind,
    #[source]
    source: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl EditError {
    /// Creates a new error from a known kind and an arbitrary payload.
    pub fn new<E>(kind: EditErrorKind, source: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        let source = Some(source.into());
        Self { kind, source }
    }

    /// Creates an environment-level error for the named file operation.
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::new(EditErrorKind::Io(operation), source)
    }

    /// Returns the corresponding [`EditErrorKind`] for this error.
    pub fn kind(&self) -> &EditErrorKind {
        &self.kind
    }
}

impl From<EditErrorKind> for EditError {
    fn from(kind: EditErrorKind) -> Self {
        Self { kind, source: None }
    }
}
