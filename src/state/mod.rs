//! Durable state: requests, tasks and provenance on disk.

pub mod migration;
mod store;

pub use migration::upgrade_task;
pub use store::StateStore;
