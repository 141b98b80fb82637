//! Repository Module
//!
//! Data access layer for the orchestrator.
//! Jobs live in memory only; nothing survives a restart.

pub mod job;

// Re-export for convenience
pub use job as job_repository;
