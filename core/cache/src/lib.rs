//! Durable local cache for tripsync.
//!
//! This module provides a single [`CacheStore`] front over interchangeable
//! backends (SQLite on native targets, IndexedDB in the browser, and an
//! in-memory map for tests). Higher layers only ever see the store.
//!
//! # Design Principles
//! - The cache is an optimization, not the source of truth: read faults
//!   degrade to empty results instead of errors
//! - Replace-by-id writes, never field-level merges
//! - Initialization is memoized and self-heals after a lost connection

pub mod backend;
pub mod memory;
#[cfg(not(target_arch = "wasm32"))]
pub mod sqlite;
#[cfg(target_arch = "wasm32")]
pub mod indexeddb;
pub mod store;

pub use backend::{select_backend, CacheBackend, CacheConfig, MaybeSendSync};
pub use memory::MemoryBackend;
#[cfg(not(target_arch = "wasm32"))]
pub use sqlite::SqliteBackend;
#[cfg(target_arch = "wasm32")]
pub use indexeddb::IndexedDbBackend;
pub use store::CacheStore;
