//! HTTP retrieval plane: home page, snippet view, tunnel consumption,
//! tunnel count, and static assets.

pub mod handler;

pub use handler::create_router;
