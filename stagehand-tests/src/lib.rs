//! Test utilities for the stagehand workspace
//!
//! This crate provides helper functions for testing port negotiation,
//! health polling, and the launch orchestrator: an in-process HTTP stub
//! that answers with a fixed status code, and builders for assembling
//! launcher configs programmatically.

pub mod helpers;

pub use helpers::config_builder::{TestConfigBuilder, TestServiceBuilder};
pub use helpers::http_stub::{free_port, HttpStub};
