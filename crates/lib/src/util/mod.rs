//! Shared utilities: content hashing and the bounded worker pool.

pub mod hash;
pub mod pool;
