//! HTTP API: service wiring, routing, and request/response mapping.

pub mod app;
pub mod middleware;
