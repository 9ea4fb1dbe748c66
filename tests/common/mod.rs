//! Shared test utilities for scenario, integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - Engine fixtures over the in-process stores
//! - Polling helpers for background tasks

#![allow(dead_code)]

pub mod containers;
pub mod fixtures;

pub use containers::*;
pub use fixtures::*;
