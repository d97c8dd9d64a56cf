//! Core data types and I/O operations.

pub mod loaders;
pub mod writers;

pub use loaders::{CoordinateRecord, CoordinateSet, FileLibrary, LoaderError};
pub use writers::{write_filaments_csv, CoordinateWriter, WriteError};
