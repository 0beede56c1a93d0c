// Core modules implementing the store directory, segments, events, eviction planning, and errors.
pub mod error;
pub mod events;
pub mod evict;
pub mod frame;
pub mod notify;
pub mod object_id;
pub mod segment;
pub mod store;
