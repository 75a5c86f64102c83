//! Small shared utilities: id minting and tolerant JSON extraction.

pub mod id_generator;
pub mod json_relaxed;
