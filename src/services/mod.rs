//! Storage components: path handling, blob pools, the directory tree,
//! object metadata, positioned writes and multipart uploads.

pub mod blob;
pub mod bucket;
pub mod directory;
pub mod hash;
pub mod metadata;
pub mod multipart;
pub mod path;
pub mod replication;
pub mod storage_service;
pub mod uploads;
pub mod write_engine;
