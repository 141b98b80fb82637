//! Segrun Core
//!
//! Core types shared by the segrun orchestrator, runner, client and CLI.
//!
//! This crate contains:
//! - Domain types: jobs, cases, progress events and the job state machine
//! - DTOs: request/response bodies of the orchestrator HTTP API

pub mod domain;
pub mod dto;
