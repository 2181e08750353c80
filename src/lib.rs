pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod plugin;
pub mod provenance;
pub mod registry;
pub mod state;
pub mod util;
pub mod validation;
pub mod version;

pub use engine::{Submission, TaskEngine};
pub use error::{Error, Result};
