//! Shared types, errors, configuration, and utilities for the Shrike
//! benchmark harness.

pub mod config;
pub mod error;
pub mod histogram;
pub mod observability;
pub mod types;
pub mod util;
