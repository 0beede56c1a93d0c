//! Purpose: Client library for a shared-memory object store, shared by the `shmstore` CLI and tests.
//! Exports: `api` (connection, lifecycle, wait, transfer, notifications), `core` (storage layers).
//! Role: Processes create, seal and read immutable objects through mmap without copying.
//! Invariants: The store directory is the single arbiter of object state; clients re-query it.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod store_paths;
