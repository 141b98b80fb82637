//! Segrun Orchestrator
//!
//! HTTP service that accepts segmentation jobs, runs their cases through the
//! inference tool one at a time, and serves status, logs and packaged results.

pub mod api;
pub mod config;
pub mod repository;
pub mod service;
pub mod state;
