//! Core data models for the hierarchical object store.
//!
//! These entities represent buckets, directory/file nodes and multipart
//! upload sessions. They map cleanly to database tables via `sqlx::FromRow`
//! and serialize naturally as JSON via `serde`.

pub mod bucket;
pub mod multipart;
pub mod object;
