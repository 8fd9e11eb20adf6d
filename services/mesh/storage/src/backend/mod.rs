//! Storage backend implementations

pub mod file;
pub mod mem;
