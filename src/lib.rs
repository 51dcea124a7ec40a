//! Hierarchical object storage over SQLite metadata and partitioned blob
//! pools, with an S3-style multipart upload protocol.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;

#[cfg(test)]
mod test_support;
