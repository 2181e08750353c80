//! Durable artifact store and the local sync cache in front of it.

pub mod store;
pub mod sync;

pub use store::{ArtifactStore, DestageTarget, DirStore};
pub use sync::{FileSyncCache, LinkMode};
