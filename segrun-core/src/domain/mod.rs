//! Core domain types
//!
//! These types represent the jobs, cases and progress events handled by the
//! orchestrator. The orchestrator owns their mutation; the client and CLI only
//! read them back from the API.

pub mod case;
pub mod job;
pub mod log;
