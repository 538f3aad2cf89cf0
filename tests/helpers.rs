//! Shared test helpers for integration tests.

#[path = "helpers_fake_server.rs"]
pub mod fake_server;
