//! Configuration module
//!
//! Handles CLI configuration including orchestrator URL and polling settings.

use std::time::Duration;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the orchestrator service
    pub orchestrator_url: String,
    /// Delay between two status polls when waiting or following logs
    pub poll_interval: Duration,
}
