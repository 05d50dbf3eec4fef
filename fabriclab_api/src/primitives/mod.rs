mod disk;

pub use disk::{DiskReference, DiskReferenceParseError};
