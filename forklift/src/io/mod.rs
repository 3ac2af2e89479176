//! I/O adapters for the run pipeline.

pub mod env_file;
pub mod git;
pub mod metadata;
pub mod ownership;
