//! Integration tests for mdstream-service.
//!
//! These tests run the facades against mock exchanges:
//! - Service start/stop lifecycle
//! - Market data flowing to the hub
//! - Cross-exchange aggregation through the unified service

pub mod common;
