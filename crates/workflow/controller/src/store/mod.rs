//! Object access for the controller
//!
//! The controller reads workflows from a local cache fed by the change
//! feed and writes through an object store. Both sit behind traits so the
//! dispatch loop runs unchanged against the in-memory cluster.

mod memory;
mod resolver;
mod traits;

pub use memory::InMemoryCluster;
pub use resolver::ConfigMapCapacityResolver;
pub use traits::{ArchiveStore, IndexName, ObjectStore, WorkflowCache};
