//! glacier-backup library
//!
//! Chunked, parallel, tree-hash verified multipart uploads to cold storage,
//! with a bounded retention ledger kept in an attribute store.

pub mod backup;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod error;
pub mod ledger;
pub mod logger;
pub mod plan;
pub mod pool;
pub mod progress;
pub mod service;
pub mod upload;
