//! `harvest-core` — configuration and shared error types for the Harvest
//! job-scheduling workspace.

pub mod config;
pub mod error;

pub use config::HarvestConfig;
pub use error::{HarvestError, Result};
