//! SSH ingestion plane.
//!
//! Accepts SSH connections from any client key, admits them through the
//! per-IP rate limiter, and drives the requested mode: basic snippet ingest
//! into the store, or a live tunnel registered for the HTTP plane to drain.

pub mod server;
pub mod session;

pub use server::start_ssh_server;
