//! Core data types shared by the parser, compiler, VM and module layers:
//! the small, dependency-free building blocks every other layer builds
//! on, with no parsing or evaluation logic of its own.

pub mod bigrational;
pub mod error;
pub mod note_id;
pub mod property;
pub mod value;

pub use bigrational::BigRational;
pub use error::{CoreError, Span};
pub use note_id::NoteId;
pub use property::{ALL_PROPERTIES, Property};
pub use value::{Computed, Value};
