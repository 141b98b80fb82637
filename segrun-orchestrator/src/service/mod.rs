//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services sit between the HTTP handlers and the job registry and drive
//! job execution.

pub mod job;
pub mod manager;
pub mod packaging;

// Re-export for convenience
pub use job as job_service;
pub use manager as job_manager;
