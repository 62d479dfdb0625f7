pub mod agent;
pub mod config;
pub mod error;
pub mod git;
pub mod github;
pub mod lifecycle;
pub mod process;
pub mod publisher;
pub mod queue;
pub mod store;
pub mod types;
pub mod worker;

pub use types::*;
