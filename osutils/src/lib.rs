pub mod dependencies;
pub mod files;
pub mod qm;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testutils;
