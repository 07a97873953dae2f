//! webai: browser-agent task orchestration for nodes, and a head that
//! authenticates and fans out across them.

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod proxy;
pub mod relay;
pub mod runner;
pub mod store;
pub mod tasks;
pub mod trust;

pub use error::{Error, Result};
