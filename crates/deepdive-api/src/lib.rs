//! HTTP surface for DeepDive research sessions.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
