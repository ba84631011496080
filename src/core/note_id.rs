//! Note identifiers.

use std::fmt;

/// A note's id within a `Module`. Id `0` is reserved for the base note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NoteId(pub u32);

impl NoteId {
    /// The reserved id of the base note.
    pub const BASE: NoteId = NoteId(0);

    /// The raw numeric value.
    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }

    /// Whether this id refers to the base note.
    #[must_use]
    pub fn is_base(self) -> bool {
        self == Self::BASE
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for NoteId {
    fn from(value: u32) -> Self {
        NoteId(value)
    }
}
