//! Data Transfer Objects for the orchestrator API
//!
//! Lightweight request and response bodies shared by the orchestrator
//! handlers and the HTTP client.

pub mod job;
