pub mod config;
pub mod constants;
pub mod error;
pub mod primitives;

/// Returns true if the value is equal to its type's default value.
pub(crate) fn is_default<T: Default + PartialEq>(value: &T) -> bool {
    *value == T::default()
}
