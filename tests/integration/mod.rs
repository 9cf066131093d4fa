//! Integration tests for the vigil instrumentation pipeline
//!
//! These tests exercise cross-module flows: slot churn on the shared export
//! page, registry wiring, and the remote read path pointed at our own
//! process.

pub mod helpers;
pub mod registry_flow;
pub mod remote_pipeline;
