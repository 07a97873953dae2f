//! HTTP layer: the node router and the head router.

pub mod error;
pub mod head;
pub mod node;
pub mod types;

pub use error::ApiJson;
pub use head::{HeadState, head_router};
pub use node::{NodeState, node_router};
