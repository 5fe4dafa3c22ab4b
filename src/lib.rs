//! vscanner - Security Scan Execution Engine
//!
//! Runs a catalog of vulnerability detectors against every target of a
//! scan. Detection scripts are untrusted and execute out of process; their
//! outcomes are partitioned per target, persisted as each target completes
//! and summed into a completion report.

pub mod config;
pub mod detector;
pub mod error;
pub mod http;
pub mod jobs;
pub mod models;
pub mod notify;
pub mod scanner;
pub mod store;
