pub mod summary;
pub mod trials;
