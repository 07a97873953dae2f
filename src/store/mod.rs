//! Persistence layer: one JSON document per task on local disk.

pub mod tasks;

pub use tasks::TaskStore;
