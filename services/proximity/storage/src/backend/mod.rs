//! Profile store backends: in-memory, JSON files, and Redis behind the
//! `redis-backend` feature.

pub mod file;
pub mod mem;

#[cfg(feature = "redis-backend")]
pub mod redis;
